//! Typed request builders for the access-control API.
//!
//! Each function returns an [`ApiRequest`](crate::api::ApiRequest) to pass to
//! [`SessionClient::request`](crate::session::SessionClient::request).

/// Card enrollment and lookup.
pub mod card;
/// User management and credential enrollment.
pub mod user;

use serde_json::Value;

use crate::api::ApiResponse;
use crate::error::SessionError;

/// Reads `pointer` out of a JSON response body.
pub(crate) fn extract(response: &ApiResponse, pointer: &str) -> Result<Value, SessionError> {
    let body: Value = response.json()?;
    body.pointer(pointer).cloned().ok_or_else(|| {
        SessionError::Protocol(format!("response is missing {pointer}"))
    })
}
