use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Code the remote uses for success in its `Response` envelope.
pub const SUCCESS_CODE: &str = "0";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoginRequest {
    #[serde(rename = "User")]
    pub user: LoginUser,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoginUser {
    pub login_id: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(login_id: &str, password: &str) -> Self {
        Self {
            user: LoginUser {
                login_id: login_id.to_string(),
                password: password.to_string(),
            },
        }
    }
}

/// `{"Response": {"code": ..., "message": ...}}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(rename = "Response")]
    pub response: ResponseStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseStatus {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.response.code == SUCCESS_CODE
    }
}

/// Classification of a push event by its top-level object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PushEventKind {
    /// Access log entry (`Event`).
    Access,
    /// Device status change (`Device`).
    Device,
    /// Door status change (`Door`).
    Door,
    /// Zone alarm or status change (`Zone`).
    Zone,
    Other,
}

/// One server-originated message delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    raw: Value,
}

impl PushEvent {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::new)
    }

    pub fn kind(&self) -> PushEventKind {
        let Some(object) = self.raw.as_object() else {
            return PushEventKind::Other;
        };
        if object.contains_key("Event") {
            PushEventKind::Access
        } else if object.contains_key("Device") {
            PushEventKind::Device
        } else if object.contains_key("Door") {
            PushEventKind::Door
        } else if object.contains_key("Zone") {
            PushEventKind::Zone
        } else {
            PushEventKind::Other
        }
    }

    /// Body of the top-level object, e.g. the contents of `Event`.
    pub fn body(&self) -> Option<&Value> {
        let key = match self.kind() {
            PushEventKind::Access => "Event",
            PushEventKind::Device => "Device",
            PushEventKind::Door => "Door",
            PushEventKind::Zone => "Zone",
            PushEventKind::Other => return None,
        };
        self.raw.get(key)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }
}

/// Inbound socket frame after JSON decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    /// Authentication acknowledgement carrying a `Response` envelope.
    Ack(ResponseEnvelope),
    Event(PushEvent),
}

impl SocketFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("Response").is_some() {
            if let Ok(envelope) = serde_json::from_value::<ResponseEnvelope>(value.clone()) {
                return Ok(Self::Ack(envelope));
            }
        }
        Ok(Self::Event(PushEvent::new(value)))
    }
}

/// Text of the authentication frame sent when the socket opens.
pub fn auth_frame(session_id: &str) -> String {
    format!("bs-session-id={session_id}")
}
