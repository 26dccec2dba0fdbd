//! HTTP request descriptors, the `{code, data}` envelope and API errors.

use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for AP requests.
pub const USER_AGENT: &str = concat!("ap-client/", env!("CARGO_PKG_VERSION"));

/// Categories of API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// Request never produced a response (connect error, reset, timeout)
    Transport,
    /// Non-2xx HTTP status
    HttpStatus,
    /// 2xx response whose envelope `code` was not 0
    Envelope,
    /// Body was not the JSON we expected
    Parse,
    /// No access token available to attach
    MissingAccessToken,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorKind::Transport => write!(f, "transport"),
            ApiErrorKind::HttpStatus => write!(f, "http_status"),
            ApiErrorKind::Envelope => write!(f, "envelope"),
            ApiErrorKind::Parse => write!(f, "parse"),
            ApiErrorKind::MissingAccessToken => write!(f, "missing_access_token"),
        }
    }
}

/// Structured error from the backend with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// HTTP status, when a response was received
    pub status: Option<u16>,
    /// Optional raw body or extra context
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    pub fn transport(err: &reqwest::Error) -> Self {
        Self::new(ApiErrorKind::Transport, format!("Network error: {err}"))
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Parse, message)
    }

    pub fn missing_access_token() -> Self {
        Self::new(
            ApiErrorKind::MissingAccessToken,
            "Not logged in: no access token available",
        )
    }

    /// Creates an HTTP status error, preferring a server-supplied message.
    pub fn http_status(status: u16, body: &str) -> Self {
        let server_message = serde_json::from_str::<Value>(body)
            .ok()
            .as_ref()
            .and_then(error_message_from_body);
        Self {
            kind: ApiErrorKind::HttpStatus,
            message: server_message.unwrap_or_else(|| format!("HTTP {status}")),
            status: Some(status),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

/// Result type for backend operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Extracts a display message from `error`, `msg`, `message` (in that order).
pub fn error_message_from_body(body: &Value) -> Option<String> {
    ["error", "msg", "message"].iter().find_map(|key| {
        let value = body.get(*key)?;
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())?,
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

/// Unwraps a `{code: 0, data}` envelope.
///
/// Bodies without a `code` field are returned as-is.
///
/// # Errors
/// Returns an error for non-2xx status, non-JSON bodies, or a non-zero code.
pub fn unwrap_envelope(status: u16, body: &str) -> ApiResult<Value> {
    if !(200..300).contains(&status) {
        return Err(ApiError::http_status(status, body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let json: Value = serde_json::from_str(body).map_err(|e| ApiError {
        kind: ApiErrorKind::Parse,
        message: format!("Invalid JSON response: {e}"),
        status: Some(status),
        details: Some(body.to_string()),
    })?;

    let Some(code) = json.get("code") else {
        return Ok(json);
    };
    let ok = match code {
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s.trim() == "0",
        _ => false,
    };
    if ok {
        return Ok(json.get("data").cloned().unwrap_or(Value::Null));
    }
    Err(ApiError {
        kind: ApiErrorKind::Envelope,
        message: error_message_from_body(&json).unwrap_or_else(|| format!("API error code {code}")),
        status: Some(status),
        details: Some(body.to_string()),
    })
}

/// Reads a response body and unwraps its envelope.
///
/// # Errors
/// Returns an error if the body cannot be read or the envelope is an error.
pub async fn read_envelope(response: reqwest::Response) -> ApiResult<Value> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| ApiError::transport(&e))?;
    unwrap_envelope(status, &body)
}

/// A request that can be replayed (the 401 retry needs to send it twice).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
    pub accept: Option<&'static str>,
    /// Whole-request timeout. Left unset for streaming requests.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            query: Vec::new(),
            accept: None,
            timeout: None,
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            query: Vec::new(),
            accept: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the reqwest request against `url`.
    pub fn build(
        &self,
        client: &reqwest::Client,
        url: &str,
        bearer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = client
            .request(self.method.clone(), url)
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        if !self.query.is_empty() {
            req = req.query(&self.query);
        }
        if let Some(accept) = self.accept {
            req = req.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = &self.body {
            req = req.json(body);
        }
        req
    }
}

/// Joins a base URL and an absolute path.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
