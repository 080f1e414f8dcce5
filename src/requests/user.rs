use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::ApiRequest;
use crate::requests::extract;

/// Parameters for [`create_user`].
#[derive(Clone, Debug, PartialEq)]
pub struct CreateUser {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub access_group_id: Option<String>,
    pub pin: Option<String>,
    /// Hours added to start and expiry before sending; the remote stores
    /// naive local times.
    pub tz_offset_hours: i64,
}

/// Filter for [`get_users`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserQuery {
    pub group_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Result of [`check_face_spec`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FaceSpec {
    pub image: String,
    pub image_template: String,
}

pub fn create_user(param: &CreateUser) -> ApiRequest<Value> {
    let offset = ChronoDuration::hours(param.tz_offset_hours);
    let mut user = json!({
        "user_id": param.id,
        "name": param.name,
        "user_group_id": {"id": param.group_id},
        "start_datetime": format_datetime(param.start_time + offset),
        "expiry_datetime": format_datetime(param.expiry_time + offset),
    });

    if let Some(access_group_id) = param.access_group_id.as_deref() {
        user["access_groups"] = json!([{"id": access_group_id}]);
    }
    if let Some(pin) = param.pin.as_deref() {
        user["pin"] = json!(pin);
    }

    ApiRequest::post("/users").with_json(json!({ "User": user }))
}

pub fn delete_user(id: &str) -> ApiRequest<Value> {
    ApiRequest::delete(format!("/users?id={id}"))
}

/// Fetches one user record (the `User` object).
pub fn get_user(user_id: &str) -> ApiRequest<Value> {
    ApiRequest::<Value>::get(format!("/users/{user_id}"))
        .map_result(|response| extract(&response, "/User"))
}

/// Lists user records (`UserCollection.rows`).
pub fn get_users(query: &UserQuery) -> ApiRequest<Vec<Value>> {
    let mut params = Vec::new();
    if let Some(group_id) = query.group_id.as_deref() {
        params.push(format!("group_id={group_id}"));
    }
    if let Some(limit) = query.limit {
        params.push(format!("limit={limit}"));
    }
    if let Some(offset) = query.offset {
        params.push(format!("offset={offset}"));
    }

    ApiRequest::<Value>::get(format!("/users?{}", params.join("&"))).map_result(|response| {
        let rows = extract(&response, "/UserCollection/rows")?;
        Ok(serde_json::from_value(rows)?)
    })
}

/// Assigns an existing card to a user.
pub fn register_card(user_id: &str, card_id: &str) -> ApiRequest<Value> {
    ApiRequest::put(format!("/users/{user_id}")).with_json(json!({
        "User": {"cards": [{"id": card_id}]}
    }))
}

/// Stores a photo and enrolls it as the user's visual face credential.
pub fn register_face_template(user_id: &str, base64_picture: &str) -> ApiRequest<Value> {
    ApiRequest::put(format!("/users/{user_id}")).with_json(json!({
        "User": {
            "photo": base64_picture,
            "credentials": {
                "visualFaces": [{
                    "template_ex_picture": base64_picture,
                    "useProfile": "false",
                }]
            }
        }
    }))
}

/// Validates a picture for face enrollment.
pub fn check_face_spec(base64_picture: &str) -> ApiRequest<FaceSpec> {
    ApiRequest::put("/users/check/upload_picture").with_json(json!({
        "template_ex_picture": base64_picture,
    }))
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
