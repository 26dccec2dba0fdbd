//! Callbacks from the chat runtime to whatever embeds it.

use serde_json::Value;

use crate::state::FrontendToolState;

/// Embedder hooks. Every method has a no-op default.
pub trait ChatHost: Send {
    /// The backend pinned a chat id (first message of a new chat).
    fn chat_id_bound(&mut self, _chat_id: &str) {}

    /// A backend action other than `show_modal`.
    fn execute_action(&mut self, _action_name: &str, _args: &Value) {}

    /// A frontend tool became active and should be shown.
    fn frontend_tool_activated(&mut self, _tool: &FrontendToolState) {}

    /// Message for the rendered tool view (`tool_init`).
    fn post_to_frontend_tool(&mut self, _message: &Value) {}
}

/// Host that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl ChatHost for NoopHost {}
