use serde_json::{Value, json};

use super::Step;
use crate::effects::ChatEffect;
use crate::events::{
    ACTION_LABEL_KEYS, EntryState, EventKind, TOOL_LABEL_KEYS, action_label, first_str, has_error,
    id_field, status_field, str_field, tool_label, value_text,
};
use crate::frontend_tool::{render_mode_for, sync_params};
use crate::runtime_maps::{ArgsBuffer, Family, RuntimeMaps};
use crate::state::{
    ActionEntry, ChatState, EntryKind, FrontendToolState, RenderMode, ToolEntry,
};

const INLINE_ARGS_KEYS: &[&str] = &["toolParams", "params", "args", "arguments"];
const ARGS_DELTA_KEYS: &[&str] = &["delta", "args", "arguments", "text"];
const RESULT_KEYS: &[&str] = &["result", "output", "content"];

/// Full arguments carried on a start/snapshot/end event.
fn inline_args(event: &Value) -> Option<String> {
    INLINE_ARGS_KEYS
        .iter()
        .find_map(|k| event.get(*k))
        .filter(|v| !v.is_null())
        .map(value_text)
}

fn args_delta(event: &Value) -> Option<&str> {
    ARGS_DELTA_KEYS
        .iter()
        .find_map(|k| event.get(*k).and_then(Value::as_str))
}

fn chunk_index(event: &Value) -> Option<u64> {
    match event.get("chunkIndex")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn result_text(event: &Value) -> Option<String> {
    RESULT_KEYS
        .iter()
        .find_map(|k| event.get(*k))
        .filter(|v| !v.is_null())
        .map(value_text)
}

fn error_text(event: &Value) -> Option<String> {
    if !has_error(event) {
        return None;
    }
    event.get("error").map(|e| match e {
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| e.to_string(), ToString::to_string),
        other => value_text(other),
    })
}

/// Terminal state for an end event, keeping an earlier failure.
fn end_state(current: EntryState, event: &Value) -> EntryState {
    if current == EntryState::Failed {
        return current;
    }
    status_field(event).unwrap_or(if has_error(event) {
        EntryState::Failed
    } else {
        EntryState::Done
    })
}

fn feed_args(args: &mut ArgsBuffer, event: &Value, kind_is_args: bool, kind_carries_full: bool) {
    if kind_is_args {
        if let Some(delta) = args_delta(event) {
            args.push(delta, chunk_index(event));
        }
    } else if kind_carries_full && let Some(full) = inline_args(event) {
        args.replace(full);
    }
}

fn parsed_params(args: &ArgsBuffer) -> Option<Value> {
    if args.is_empty() || args.has_gap() {
        return None;
    }
    args.parse().ok()
}

pub(super) fn apply_tool(
    state: &mut ChatState,
    maps: &mut RuntimeMaps,
    step: &mut Step<'_>,
    kind: &EventKind,
) {
    let event = step.event;
    let Some(tool_id) = id_field(event, "toolId").or_else(|| id_field(event, "id")) else {
        tracing::debug!("Ignoring tool event without toolId");
        return;
    };
    let entry_id = maps.entry_id(Family::Tool, &tool_id);
    let scratch = maps.tools.entry(tool_id.clone()).or_default();
    feed_args(
        &mut scratch.args,
        event,
        *kind == EventKind::ToolArgs,
        matches!(kind, EventKind::ToolStart | EventKind::ToolSnapshot | EventKind::ToolEnd),
    );
    let args_text = scratch.args.text();
    let params = parsed_params(&scratch.args);

    let entry = state.entry_or_insert_with(&entry_id, step.ts, || {
        EntryKind::Tool(ToolEntry {
            tool_id: tool_id.clone(),
            tool_key: None,
            tool_type: None,
            label: tool_label(event),
            args_text: String::new(),
            params: None,
            result_text: String::new(),
            error: None,
            state: EntryState::Init,
        })
    });
    let EntryKind::Tool(tool) = &mut entry.kind else {
        return;
    };
    if let Some(key) = str_field(event, "toolKey") {
        tool.tool_key = Some(key.to_string());
    }
    if let Some(tool_type) = str_field(event, "toolType") {
        tool.tool_type = Some(tool_type.to_string());
    }
    if let Some(label) = first_str(event, TOOL_LABEL_KEYS) {
        tool.label = label.to_string();
    }
    tool.args_text = args_text;
    if params.is_some() {
        tool.params = params;
    }

    match kind {
        EventKind::ToolStart | EventKind::ToolArgs => {
            if tool.state == EntryState::Init {
                tool.state = EntryState::Running;
            }
        }
        EventKind::ToolSnapshot => {
            if let Some(result) = result_text(event) {
                tool.result_text = result;
            }
            tool.state = status_field(event).unwrap_or(if has_error(event) {
                EntryState::Failed
            } else if tool.state == EntryState::Init {
                EntryState::Running
            } else {
                tool.state
            });
        }
        EventKind::ToolResult => {
            tool.result_text = result_text(event).unwrap_or_default();
            tool.state = if has_error(event) {
                EntryState::Failed
            } else {
                EntryState::Done
            };
        }
        EventKind::ToolEnd => {
            if tool.result_text.is_empty()
                && let Some(result) = result_text(event)
            {
                tool.result_text = result;
            }
            tool.state = end_state(tool.state, event);
        }
        _ => {}
    }
    if let Some(error) = error_text(event) {
        tool.error = Some(error);
    }

    let tool_key = tool.tool_key.clone();
    let tool_type = tool.tool_type.clone();
    let tool_name = str_field(event, "toolName").map(ToString::to_string);
    let terminal = tool.state.is_terminal();
    let Some(render_mode) = render_mode_for(tool_type.as_deref(), tool_key.as_deref()) else {
        return;
    };

    let already_active = state
        .active_frontend_tool
        .as_ref()
        .is_some_and(|t| t.tool_id == tool_id);
    if matches!(kind, EventKind::ToolStart | EventKind::ToolSnapshot)
        && step.is_live()
        && !terminal
        && !already_active
    {
        let run_id = id_field(event, "runId")
            .or_else(|| maps.run_id.clone())
            .unwrap_or_default();
        let mut frontend = FrontendToolState {
            run_id: run_id.clone(),
            tool_id: tool_id.clone(),
            tool_key: tool_key.clone(),
            tool_type: tool_type.clone(),
            tool_name,
            render_mode,
            tool_timeout: event.get("toolTimeout").and_then(Value::as_u64),
            tool_params: None,
            params_ready: false,
            params_error: None,
            args_text: String::new(),
            missing_chunk_indexes: Vec::new(),
            chunk_gap_detected: false,
            tool_init_dispatched: false,
            user_interacted: false,
            init_attempt: 0,
            init_last_sent_at_ms: None,
            viewport_html: None,
            loading: render_mode == RenderMode::Webview,
            load_error: None,
        };
        if let Some(scratch) = maps.tools.get(&tool_id) {
            sync_params(&mut frontend, &scratch.args, false);
        }
        state.active_frontend_tool = Some(frontend);
        step.effects.push(ChatEffect::ActivateFrontendTool {
            run_id,
            tool_id,
            tool_key,
            tool_type,
            render_mode,
        });
        return;
    }

    if let Some(active) = state
        .active_frontend_tool
        .as_mut()
        .filter(|t| t.tool_id == tool_id)
        && let Some(scratch) = maps.tools.get(&tool_id)
    {
        let became_ready = sync_params(active, &scratch.args, *kind == EventKind::ToolEnd);
        if became_ready && step.is_live() {
            step.effects.push(ChatEffect::FrontendToolParamsReady {
                run_id: active.run_id.clone(),
                tool_id: active.tool_id.clone(),
                params: active.tool_params.clone().unwrap_or_else(|| json!({})),
            });
        }
    }
}

pub(super) fn apply_action(
    state: &mut ChatState,
    maps: &mut RuntimeMaps,
    step: &mut Step<'_>,
    kind: &EventKind,
) {
    let event = step.event;
    let Some(action_id) = id_field(event, "actionId").or_else(|| id_field(event, "id")) else {
        tracing::debug!("Ignoring action event without actionId");
        return;
    };
    let entry_id = maps.entry_id(Family::Action, &action_id);
    let scratch = maps.actions.entry(action_id.clone()).or_default();
    feed_args(
        &mut scratch.args,
        event,
        *kind == EventKind::ActionArgs,
        matches!(
            kind,
            EventKind::ActionStart | EventKind::ActionSnapshot | EventKind::ActionEnd
        ),
    );

    let entry = state.entry_or_insert_with(&entry_id, step.ts, || {
        EntryKind::Action(ActionEntry {
            action_id: action_id.clone(),
            action_name: None,
            label: action_label(event),
            description: None,
            args_text: String::new(),
            result_text: String::new(),
            state: EntryState::Init,
        })
    });
    let EntryKind::Action(action) = &mut entry.kind else {
        return;
    };
    if let Some(name) = first_str(event, &["actionName", "name"]) {
        action.action_name = Some(name.to_string());
    }
    if let Some(label) = first_str(event, ACTION_LABEL_KEYS) {
        action.label = label.to_string();
    }
    if let Some(description) = str_field(event, "description") {
        action.description = Some(description.to_string());
    }
    action.args_text = scratch.args.text();

    match kind {
        EventKind::ActionStart | EventKind::ActionArgs => {
            if action.state == EntryState::Init {
                action.state = EntryState::Running;
            }
        }
        EventKind::ActionSnapshot => {
            if let Some(result) = result_text(event) {
                action.result_text = result;
            }
            if let Some(status) = status_field(event) {
                action.state = status;
            } else if action.state == EntryState::Init {
                action.state = EntryState::Running;
            }
        }
        EventKind::ActionResult => {
            action.result_text = result_text(event).unwrap_or_default();
            action.state = if has_error(event) {
                EntryState::Failed
            } else {
                EntryState::Done
            };
        }
        EventKind::ActionEnd => {
            if action.result_text.is_empty()
                && let Some(result) = result_text(event)
            {
                action.result_text = result;
            }
            action.state = end_state(action.state, event);
        }
        _ => {}
    }

    if *kind != EventKind::ActionEnd || !step.is_live() || scratch.executed {
        return;
    }
    scratch.executed = true;
    let Some(action_name) = action.action_name.clone() else {
        tracing::debug!(action_id = %action_id, "Action ended without a name; nothing to execute");
        return;
    };
    let args = match scratch.args.parse() {
        Ok(args) => args,
        Err(_) => Value::String(scratch.args.text()),
    };
    step.effects.push(ChatEffect::ExecuteAction {
        action_id,
        action_name,
        args,
    });
}
