//! Chat effect types.
//!
//! Effects are commands returned by the reducer that the runtime executes.
//! They describe dispatch, network calls and timer changes; the reducer
//! never performs any of them itself.
//!
//! ## Live vs History
//!
//! Only `SetChatId` is emitted while replaying history. Activation, action
//! execution and stream-end hints are live-only.

use serde_json::Value;

use crate::state::RenderMode;

/// Effects returned by the reducer for the runtime to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEffect {
    /// The backend pinned the chat id.
    SetChatId { chat_id: String },

    /// Run a backend-requested action on the client.
    ExecuteAction {
        action_id: String,
        action_name: String,
        args: Value,
    },

    /// The run ended; stop the idle timer.
    StreamEnd,

    /// A frontend tool became the active tool.
    ActivateFrontendTool {
        run_id: String,
        tool_id: String,
        tool_key: Option<String>,
        tool_type: Option<String>,
        render_mode: RenderMode,
    },

    /// Parameters for the active tool finished assembling after activation.
    FrontendToolParamsReady {
        run_id: String,
        tool_id: String,
        params: Value,
    },
}
