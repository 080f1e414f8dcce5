//! Authenticated HTTP calls and their result/error mapping.
//!
//! An [`ApiRequest`] describes one call relative to the `/api` prefix together
//! with the pure transforms applied to its outcome. [`ApiTransport`] performs
//! the login, logout and session-authenticated calls.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::session::proto::LoginRequest;

/// Header carrying the session token on requests and the login response.
pub const SESSION_HEADER: &str = "bs-session-id";
const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Transforms a successful response into the caller's result type.
pub type ResultMapper<T> = Arc<dyn Fn(ApiResponse) -> Result<T, SessionError> + Send + Sync>;
/// Transforms a non-success response into a domain error.
pub type ErrorMapper = Arc<dyn Fn(HttpFailure) -> SessionError + Send + Sync>;

/// Successful HTTP response handed to a [`ResultMapper`].
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    /// Parses the body as JSON. An empty body parses as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        let body = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(body).map_err(SessionError::Json)
    }
}

/// Non-success HTTP response handed to an [`ErrorMapper`].
#[derive(Clone, Debug)]
pub struct HttpFailure {
    pub status: StatusCode,
    pub body: String,
}

/// One authenticated call against the remote API.
pub struct ApiRequest<T> {
    pub method: Method,
    /// Path below `/api`, including any query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    map_result: ResultMapper<T>,
    map_error: ErrorMapper,
}

impl<T: DeserializeOwned + 'static> ApiRequest<T> {
    /// Creates a request whose JSON body is deserialized into `T`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self::with_result_mapper(method, path, |response| response.json())
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }
}

impl<T> ApiRequest<T> {
    /// Creates a request with an explicit result mapper.
    pub fn with_result_mapper<F>(method: Method, path: impl Into<String>, mapper: F) -> Self
    where
        F: Fn(ApiResponse) -> Result<T, SessionError> + Send + Sync + 'static,
    {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            map_result: Arc::new(mapper),
            map_error: Arc::new(default_error_mapper),
        }
    }

    /// Sets a JSON body.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header. Caller headers override the defaults.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the result mapper, changing the result type.
    pub fn map_result<U, F>(self, mapper: F) -> ApiRequest<U>
    where
        F: Fn(ApiResponse) -> Result<U, SessionError> + Send + Sync + 'static,
    {
        ApiRequest {
            method: self.method,
            path: self.path,
            headers: self.headers,
            body: self.body,
            map_result: Arc::new(mapper),
            map_error: self.map_error,
        }
    }

    /// Replaces the error mapper.
    pub fn map_error<F>(mut self, mapper: F) -> Self
    where
        F: Fn(HttpFailure) -> SessionError + Send + Sync + 'static,
    {
        self.map_error = Arc::new(mapper);
        self
    }

    #[cfg(test)]
    pub(crate) fn run_result_mapper(&self, response: ApiResponse) -> Result<T, SessionError> {
        (self.map_result)(response)
    }
}

impl<T> fmt::Debug for ApiRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Default error mapper: reads `Response.message` from a JSON error body.
///
/// Bodies that are not the remote's error envelope become
/// [`SessionError::HttpStatus`] with a truncated snippet.
pub fn default_error_mapper(failure: HttpFailure) -> SessionError {
    #[derive(Debug, Deserialize)]
    struct ErrorEnvelope {
        #[serde(rename = "Response")]
        response: ErrorResponse,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorResponse {
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(data) = serde_json::from_str::<Value>(&failure.body) {
        if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(data.clone()) {
            let message = envelope
                .response
                .message
                .unwrap_or_else(|| format!("request failed with status {}", failure.status));
            return SessionError::Remote {
                message,
                status: failure.status,
                data: Some(data),
            };
        }
    }

    SessionError::HttpStatus {
        status: failure.status,
        body: summarize_error_body(&failure.body),
    }
}

fn summarize_error_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

/// HTTP side of a session: login, logout and authenticated requests.
#[derive(Clone, Debug)]
pub struct ApiTransport {
    http: Client,
    base_url: String,
}

impl ApiTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, SessionError> {
        let http = Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(!config.reject_unauthorized)
            .build()
            .map_err(SessionError::Transport)?;

        Ok(Self {
            http,
            base_url: config.api_base_url(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Logs in and returns the session token from the response header.
    pub async fn login(
        &self,
        login_id: &str,
        password: &SecretString,
    ) -> Result<SecretString, SessionError> {
        let body = LoginRequest::new(login_id, password.expose_secret());
        let response = self
            .http
            .post(self.endpoint("/login"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Authentication {
                message: "unauthorized".to_string(),
                status: Some(status),
                data: None,
            });
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                SessionError::Protocol(format!("{SESSION_HEADER} not found in login response"))
            })?;

        Ok(SecretString::new(session_id.to_string()))
    }

    /// Ends the remote session.
    pub async fn logout(&self, session_id: &SecretString) -> Result<(), SessionError> {
        let request: ApiRequest<()> =
            ApiRequest::with_result_mapper(Method::POST, "/logout", |_| Ok(()));
        self.send(session_id, request).await
    }

    /// Issues one call authenticated with `session_id`.
    pub async fn send<T>(
        &self,
        session_id: &SecretString,
        request: ApiRequest<T>,
    ) -> Result<T, SessionError> {
        let ApiRequest {
            method,
            path,
            headers: extra_headers,
            body,
            map_result,
            map_error,
        } = request;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let token = HeaderValue::from_str(session_id.expose_secret())
            .map_err(|_| SessionError::Protocol("session id is not a valid header".to_string()))?;
        headers.insert(HeaderName::from_static(SESSION_HEADER), token);
        for (name, value) in extra_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        let mut builder = self
            .http
            .request(method, self.endpoint(&path))
            .headers(headers);
        if let Some(body) = body.as_ref() {
            builder = builder.body(serde_json::to_string(body)?);
        }

        let response = builder.send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::unauthorized());
        }
        if !status.is_success() {
            return Err(map_error(HttpFailure { status, body }));
        }

        map_result(ApiResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}
