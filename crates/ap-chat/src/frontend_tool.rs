//! Frontend tool hand-off.
//!
//! Some backend tools are rendered by the client (an HTML viewport or a
//! native confirm dialog) and finish only when the user submits. This module
//! recognizes those tools, tracks their parameter assembly, and builds the
//! messages exchanged with the rendered view.

use std::fmt;

use serde_json::{Value, json};

use crate::runtime_maps::{ArgsBuffer, MAX_CHUNK_INDEX};
use crate::state::{FrontendToolState, RenderMode};

const WEBVIEW_TOOL_TYPES: &[&str] = &["html", "webview", "frontend"];
const NATIVE_CONFIRM_TOOL_TYPE: &str = "native_confirm";
const NATIVE_CONFIRM_TOOL_KEY: &str = "confirm_dialog";

/// Render mode for a `(toolType, toolKey)` pair, if the client renders it.
pub fn render_mode_for(tool_type: Option<&str>, tool_key: Option<&str>) -> Option<RenderMode> {
    let tool_type = tool_type.map(|t| t.trim().to_ascii_lowercase());
    let tool_key = tool_key.map(str::trim);
    if tool_type.as_deref() == Some(NATIVE_CONFIRM_TOOL_TYPE)
        || tool_key == Some(NATIVE_CONFIRM_TOOL_KEY)
    {
        return Some(RenderMode::NativeConfirmDialog);
    }
    match tool_type {
        Some(t) if WEBVIEW_TOOL_TYPES.contains(&t.as_str()) => Some(RenderMode::Webview),
        _ => None,
    }
}

/// Copies assembly progress from `args` into the tool.
///
/// Returns true when the parameters became ready in this call. A gap in the
/// chunk indexes holds readiness back; an empty buffer is not ready until
/// `finalize` is set (the tool ended with no arguments).
pub(crate) fn sync_params(tool: &mut FrontendToolState, args: &ArgsBuffer, finalize: bool) -> bool {
    let was_ready = tool.params_ready;
    tool.args_text = args.text();
    if let Some(index) = args.overflow() {
        tool.missing_chunk_indexes.clear();
        tool.chunk_gap_detected = true;
        tool.params_error = Some(format!(
            "Tool argument chunk index {index} exceeds the limit of {MAX_CHUNK_INDEX}"
        ));
        return false;
    }
    tool.missing_chunk_indexes = args.missing_indexes();
    tool.chunk_gap_detected = !tool.missing_chunk_indexes.is_empty();

    if tool.chunk_gap_detected {
        if finalize && !tool.params_ready {
            tool.params_error = Some(format!(
                "Tool arguments are missing chunks {:?}",
                tool.missing_chunk_indexes
            ));
        }
        return false;
    }
    if args.is_empty() && !finalize {
        return false;
    }
    match args.parse() {
        Ok(params) => {
            tool.tool_params = Some(params);
            tool.params_ready = true;
            tool.params_error = None;
        }
        Err(e) if finalize && !tool.params_ready => tool.params_error = Some(e),
        Err(_) => {}
    }
    !was_ready && tool.params_ready
}

/// Why a `tool_init` message cannot be sent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitBlocked {
    ParamsNotReady,
    ParamsInvalid(String),
    ViewportNotLoaded,
}

impl fmt::Display for InitBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitBlocked::ParamsNotReady => write!(f, "tool parameters are not ready"),
            InitBlocked::ParamsInvalid(e) => write!(f, "tool parameters are invalid: {e}"),
            InitBlocked::ViewportNotLoaded => write!(f, "viewport has not loaded"),
        }
    }
}

/// Builds the `tool_init` message and records the attempt on the tool.
///
/// # Errors
/// Returns [`InitBlocked`] while parameters are incomplete or invalid, or a
/// webview tool has no HTML yet.
pub fn dispatch_tool_init(tool: &mut FrontendToolState, now_ms: i64) -> Result<Value, InitBlocked> {
    if let Some(err) = &tool.params_error {
        return Err(InitBlocked::ParamsInvalid(err.clone()));
    }
    if !tool.params_ready || tool.chunk_gap_detected {
        return Err(InitBlocked::ParamsNotReady);
    }
    if tool.render_mode == RenderMode::Webview && tool.viewport_html.is_none() {
        return Err(InitBlocked::ViewportNotLoaded);
    }
    tool.init_attempt += 1;
    tool.init_last_sent_at_ms = Some(now_ms);
    tool.tool_init_dispatched = true;
    Ok(json!({
        "type": "tool_init",
        "data": {
            "runId": tool.run_id,
            "toolId": tool.tool_id,
            "toolKey": tool.tool_key,
            "toolType": tool.tool_type,
            "params": tool.tool_params.clone().unwrap_or_else(|| json!({})),
        }
    }))
}

/// Message posted by a rendered view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewMessage {
    FrontendSubmit { params: Value },
    ChatMessage { text: String },
}

impl ViewMessage {
    /// Parses a view message; unknown or malformed payloads yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        match value.get("type").and_then(Value::as_str)? {
            "frontend_submit" => Some(ViewMessage::FrontendSubmit {
                params: value.get("params").cloned().unwrap_or_else(|| json!({})),
            }),
            "chat_message" => {
                let text = value.get("text").and_then(Value::as_str)?.trim();
                (!text.is_empty()).then(|| ViewMessage::ChatMessage {
                    text: text.to_string(),
                })
            }
            _ => None,
        }
    }
}
