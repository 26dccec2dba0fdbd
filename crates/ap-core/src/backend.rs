//! Backend endpoint client.
//!
//! Every call goes through [`AuthCoordinator::authorized_fetch`], so each one
//! gets the bearer token and the single 401 refresh-and-retry.

use std::time::Duration;

use serde_json::{Value, json};

use crate::auth::{AuthCoordinator, FreshTokenOptions};
use crate::cache::ChatSummary;
use crate::http::{self, ApiError, ApiRequest, ApiResult};

pub const QUERY_PATH: &str = "/api/ap/query";
pub const CHAT_PATH: &str = "/api/ap/chat";
pub const CHATS_PATH: &str = "/api/ap/chats";
pub const SUBMIT_PATH: &str = "/api/ap/submit";
pub const VIEWPORT_PATH: &str = "/api/ap/viewport";

const EVENT_STREAM: &str = "text/event-stream";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A new user message for `/api/ap/query`.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub request_id: String,
    pub chat_id: Option<String>,
    pub message: String,
    pub agent_key: String,
}

impl QueryRequest {
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "requestId": self.request_id,
            "message": self.message,
            "agentKey": self.agent_key,
            "role": "user",
            "stream": true,
        });
        if let Some(chat_id) = self.chat_id.as_deref().filter(|id| !id.is_empty()) {
            body["chatId"] = Value::String(chat_id.to_string());
        }
        body
    }
}

/// Bulk history for one chat.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    pub chat_id: String,
    pub chat_name: Option<String>,
    pub chat_image_token: Option<String>,
    pub events: Vec<Value>,
}

/// Server verdict on a frontend-tool submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub detail: Option<String>,
    pub status: Option<String>,
}

impl SubmitOutcome {
    fn from_value(data: &Value) -> Self {
        let text = |key: &str| match data.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Self {
            accepted: data.get("accepted").and_then(Value::as_bool).unwrap_or(false),
            detail: text("detail"),
            status: text("status"),
        }
    }

    /// User-facing text for a rejection.
    pub fn rejection_text(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.status.as_ref().map(|s| format!("Submission rejected ({s})")))
            .unwrap_or_else(|| "Submission rejected".to_string())
    }
}

/// Typed access to the AP endpoints for one backend.
#[derive(Debug, Clone)]
pub struct ApClient {
    auth: AuthCoordinator,
    base_url: String,
    timeout: Duration,
    /// Soft pre-refresh before long-lived or list calls.
    prefresh: Option<FreshTokenOptions>,
}

impl ApClient {
    pub fn new(auth: AuthCoordinator, base_url: impl Into<String>) -> Self {
        Self {
            auth,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            prefresh: None,
        }
    }

    /// Refreshes the token opportunistically before opening the query stream
    /// and syncing the chat list.
    #[must_use]
    pub fn with_prefresh(mut self, opts: FreshTokenOptions) -> Self {
        self.prefresh = Some(opts);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &AuthCoordinator {
        &self.auth
    }

    async fn prefresh(&self) {
        let Some(opts) = self.prefresh else {
            return;
        };
        if self
            .auth
            .ensure_fresh_access_token(&self.base_url, opts)
            .await
            .is_none()
        {
            tracing::debug!("Soft pre-refresh failed; keeping current session");
        }
    }

    async fn call(&self, path: &str, request: ApiRequest) -> ApiResult<Value> {
        let response = self
            .auth
            .authorized_fetch(&self.base_url, path, &request.timeout(self.timeout))
            .await?;
        http::read_envelope(response).await
    }

    /// `GET /api/ap/chat?chatId=`
    ///
    /// # Errors
    /// Returns an error on network, status or envelope failure.
    pub async fn fetch_chat(&self, chat_id: &str) -> ApiResult<ChatHistory> {
        let data = self
            .call(CHAT_PATH, ApiRequest::get().query("chatId", chat_id))
            .await?;
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(ToString::to_string);
        Ok(ChatHistory {
            chat_id: text("chatId").unwrap_or_else(|| chat_id.to_string()),
            chat_name: text("chatName"),
            chat_image_token: text("chatImageToken"),
            events: data
                .get("events")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// `GET /api/ap/chats[?lastRunId=]`
    ///
    /// # Errors
    /// Returns an error on network, status or envelope failure.
    pub async fn list_chats(&self, last_run_id: Option<&str>) -> ApiResult<Vec<ChatSummary>> {
        self.prefresh().await;
        let mut request = ApiRequest::get();
        if let Some(cursor) = last_run_id.filter(|c| !c.is_empty()) {
            request = request.query("lastRunId", cursor);
        }
        let data = self.call(CHATS_PATH, request).await?;
        let items = match &data {
            Value::Array(items) => items.as_slice(),
            Value::Object(obj) => ["chats", "list", "items"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_array))
                .map_or(&[][..], Vec::as_slice),
            _ => &[],
        };
        Ok(items.iter().filter_map(ChatSummary::from_value).collect())
    }

    /// Opens the `/api/ap/query` event stream.
    ///
    /// The response is returned as-is; the caller checks the status while
    /// reading it.
    ///
    /// # Errors
    /// Returns an error if no token is available or the request cannot be sent.
    pub async fn open_query_stream(&self, query: &QueryRequest) -> ApiResult<reqwest::Response> {
        self.prefresh().await;
        let request = ApiRequest::post(query.to_json()).accept(EVENT_STREAM);
        self.auth
            .authorized_fetch(&self.base_url, QUERY_PATH, &request)
            .await
    }

    /// `POST /api/ap/submit {runId, toolId, params}`
    ///
    /// # Errors
    /// Returns an error on network, status or envelope failure.
    pub async fn submit_frontend_tool(
        &self,
        run_id: &str,
        tool_id: &str,
        params: &Value,
    ) -> ApiResult<SubmitOutcome> {
        let body = json!({ "runId": run_id, "toolId": tool_id, "params": params });
        let data = self.call(SUBMIT_PATH, ApiRequest::post(body)).await?;
        Ok(SubmitOutcome::from_value(&data))
    }

    /// `GET /api/ap/viewport?viewportKey=` returning the tool's HTML.
    ///
    /// # Errors
    /// Returns an error on failure or when the response carries no HTML.
    pub async fn fetch_viewport(&self, viewport_key: &str) -> ApiResult<String> {
        let data = self
            .call(VIEWPORT_PATH, ApiRequest::get().query("viewportKey", viewport_key))
            .await?;
        match &data {
            Value::String(html) => Ok(html.clone()),
            other => other
                .get("html")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| ApiError::parse(format!("Viewport '{viewport_key}' has no html"))),
        }
    }
}
