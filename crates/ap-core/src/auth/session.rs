//! Session type and login/refresh payload parsing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{ApiError, ApiResult};
use crate::time;

/// Fallback validity when no expiry field parses.
pub const FALLBACK_VALIDITY_MS: i64 = 5 * 60 * 1000;

/// Expiry candidate fields, in priority order.
const EXPIRY_FIELDS: &[&str] = &[
    "accessTokenExpireAtMs",
    "accessExpireAtMs",
    "accessExpireAt",
    "accessTokenExpireAt",
    "expiresAt",
];

/// The authenticated identity for one backend.
///
/// The access token lives in memory only; `device_token` is what gets
/// persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub base_url: String,
    pub username: String,
    pub device_id: String,
    pub device_name: String,
    pub access_token: String,
    pub access_expire_at_ms: i64,
    pub device_token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("access_token", &crate::logging::mask_token(&self.access_token))
            .field("access_expire_at_ms", &self.access_expire_at_ms)
            .field("device_token", &"***")
            .finish()
    }
}

impl Session {
    /// Milliseconds of validity left at `now_ms` (negative once expired).
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.access_expire_at_ms.saturating_sub(now_ms)
    }

    /// Builds a session from a login response.
    ///
    /// # Errors
    /// Returns an error if the access or device token is missing.
    pub fn from_login(base_url: &str, data: &Value, now_ms: i64) -> ApiResult<Self> {
        Ok(Self {
            base_url: base_url.to_string(),
            username: str_field(data, "username").unwrap_or_default(),
            device_id: str_field(data, "deviceId").unwrap_or_default(),
            device_name: str_field(data, "deviceName").unwrap_or_default(),
            access_token: required(data, "accessToken")?,
            access_expire_at_ms: resolve_expiry(data, now_ms),
            device_token: required(data, "deviceToken")?,
        })
    }

    /// Builds the replacement session from a refresh response.
    ///
    /// Identity fields the refresh endpoint omits carry over from `prev`. A
    /// missing `deviceToken` keeps the old one (non-rotating backends).
    ///
    /// # Errors
    /// Returns an error if the access token is missing.
    pub fn from_refresh(prev: &Self, data: &Value, now_ms: i64) -> ApiResult<Self> {
        Ok(Self {
            base_url: prev.base_url.clone(),
            username: str_field(data, "username").unwrap_or_else(|| prev.username.clone()),
            device_id: str_field(data, "deviceId").unwrap_or_else(|| prev.device_id.clone()),
            device_name: str_field(data, "deviceName")
                .unwrap_or_else(|| prev.device_name.clone()),
            access_token: required(data, "accessToken")?,
            access_expire_at_ms: resolve_expiry(data, now_ms),
            device_token: str_field(data, "deviceToken")
                .unwrap_or_else(|| prev.device_token.clone()),
        })
    }

    /// A placeholder carrying only a restored device token, used to seed a
    /// refresh at startup.
    pub fn from_device_token(base_url: &str, device_token: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            username: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            access_token: String::new(),
            access_expire_at_ms: 0,
            device_token: device_token.to_string(),
        }
    }
}

/// Resolves the access-token expiry from the first candidate field that
/// parses, falling back to now + 5 minutes.
pub fn resolve_expiry(data: &Value, now_ms: i64) -> i64 {
    let parsed = EXPIRY_FIELDS
        .iter()
        .find_map(|field| data.get(*field).and_then(time::parse_expiry));
    parsed.unwrap_or_else(|| {
        tracing::warn!("No parseable access token expiry in auth response; assuming 5 minutes");
        now_ms + FALLBACK_VALIDITY_MS
    })
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn required(data: &Value, key: &str) -> ApiResult<String> {
    str_field(data, key).ok_or_else(|| ApiError::parse(format!("Auth response missing {key}")))
}
