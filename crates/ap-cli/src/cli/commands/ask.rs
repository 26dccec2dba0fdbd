//! One-shot question against a new or existing chat.

use anyhow::{Context, Result, bail};
use ap_chat::{ChatHost, ChatRuntime, FrontendToolState, RuntimeOptions};
use ap_core::config::Config;
use serde_json::Value;

use super::{Backend, format_entries};

/// Host for a non-interactive terminal: reports what it cannot show.
struct TerminalHost;

impl ChatHost for TerminalHost {
    fn chat_id_bound(&mut self, chat_id: &str) {
        tracing::debug!(chat_id, "Chat bound");
    }

    fn execute_action(&mut self, action_name: &str, args: &Value) {
        eprintln!("[action] {action_name} {args}");
    }

    fn frontend_tool_activated(&mut self, tool: &FrontendToolState) {
        let name = tool
            .tool_name
            .as_deref()
            .or(tool.tool_key.as_deref())
            .unwrap_or(&tool.tool_id);
        eprintln!("[tool] {name} needs an interactive client; skipping");
    }
}

pub async fn run(config: &Config, message: &str, chat_id: Option<&str>) -> Result<()> {
    let backend = Backend::new(config)?;
    backend.require_session().await?;

    let mut runtime = ChatRuntime::new(
        backend.api.clone(),
        backend.cache(),
        Box::new(TerminalHost),
        RuntimeOptions::from_config(config),
    );
    match chat_id {
        Some(id) => {
            runtime
                .open_chat(id)
                .await
                .with_context(|| format!("open chat '{id}'"))?;
        }
        None => runtime.switch_chat(None),
    }

    let seen = runtime.state().timeline.len();
    runtime.send_message(message)?;
    runtime.run_until_idle().await;

    let state = runtime.state();
    // Skip the echoed question.
    let reply = state.timeline.get(seen + 1..).unwrap_or_default();
    print!("{}", format_entries(state, reply));

    if let Some(id) = &state.chat_id {
        eprintln!("chat: {id}");
    }
    if let Some(status) = &state.status_text {
        bail!("{status}");
    }
    Ok(())
}
