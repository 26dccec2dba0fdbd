//! Event normalization.
//!
//! The backend has emitted several generations of event names for the same
//! thing (`message.delta`, `answer.delta`, `response.delta` ...). Everything
//! here is a pure function from a loosely-typed payload to canonical tags,
//! statuses and display labels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    RequestQuery,
    ContentStart,
    ContentDelta,
    ContentSnapshot,
    ContentEnd,
    ToolStart,
    ToolSnapshot,
    ToolArgs,
    ToolResult,
    ToolEnd,
    ActionStart,
    ActionSnapshot,
    ActionArgs,
    ActionResult,
    ActionEnd,
    ReasoningStart,
    ReasoningDelta,
    ReasoningSnapshot,
    ReasoningEnd,
    PlanUpdate,
    TaskStart,
    TaskEnd,
    TaskComplete,
    TaskFail,
    TaskCancel,
    RunStart,
    RunComplete,
    RunCancel,
    RunError,
    /// Unrecognized type, kept verbatim.
    Other(String),
}

impl EventKind {
    /// Reads the event's `type` field and normalizes it.
    pub fn of(event: &Value) -> Self {
        let raw = event
            .get("type")
            .or_else(|| event.get("event"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self::parse(raw)
    }

    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let (family, phase) = lowered.split_once('.').unwrap_or((lowered.as_str(), ""));
        let family = match family {
            "message" | "answer" | "response" | "text" | "assistant" | "content" => "content",
            "thinking" | "reasoning" => "reasoning",
            "user" => "request",
            other => other,
        };

        let kind = match (family, phase) {
            ("request", "query" | "message") => Some(EventKind::RequestQuery),

            ("content", "start" | "begin") => Some(EventKind::ContentStart),
            ("content", "delta" | "chunk" | "append") => Some(EventKind::ContentDelta),
            ("content", "snapshot" | "full") => Some(EventKind::ContentSnapshot),
            ("content", "end" | "complete" | "completed" | "done" | "stop") => {
                Some(EventKind::ContentEnd)
            }

            ("tool", "start" | "begin") => Some(EventKind::ToolStart),
            ("tool", "snapshot") => Some(EventKind::ToolSnapshot),
            ("tool", "args" | "args.delta" | "arguments" | "arguments.delta") => {
                Some(EventKind::ToolArgs)
            }
            ("tool", "result" | "output") => Some(EventKind::ToolResult),
            ("tool", "end" | "complete" | "completed" | "done") => Some(EventKind::ToolEnd),

            ("action", "start" | "begin") => Some(EventKind::ActionStart),
            ("action", "snapshot") => Some(EventKind::ActionSnapshot),
            ("action", "args" | "args.delta" | "arguments" | "arguments.delta") => {
                Some(EventKind::ActionArgs)
            }
            ("action", "result" | "output") => Some(EventKind::ActionResult),
            ("action", "end" | "complete" | "completed" | "done") => Some(EventKind::ActionEnd),

            ("reasoning", "start" | "begin") => Some(EventKind::ReasoningStart),
            ("reasoning", "delta" | "chunk") => Some(EventKind::ReasoningDelta),
            ("reasoning", "snapshot") => Some(EventKind::ReasoningSnapshot),
            ("reasoning", "end" | "complete" | "completed" | "done") => {
                Some(EventKind::ReasoningEnd)
            }

            ("plan", "update" | "updated" | "snapshot" | "set") => Some(EventKind::PlanUpdate),

            ("task", "start" | "started") => Some(EventKind::TaskStart),
            ("task", "end") => Some(EventKind::TaskEnd),
            ("task", "complete" | "completed" | "done") => Some(EventKind::TaskComplete),
            ("task", "fail" | "failed" | "error") => Some(EventKind::TaskFail),
            ("task", "cancel" | "cancelled" | "canceled") => Some(EventKind::TaskCancel),

            ("run", "start" | "started") => Some(EventKind::RunStart),
            ("run", "complete" | "completed" | "end" | "done") => Some(EventKind::RunComplete),
            ("run", "cancel" | "cancelled" | "canceled") => Some(EventKind::RunCancel),
            ("run", "error" | "failed") => Some(EventKind::RunError),
            _ => None,
        };
        kind.unwrap_or_else(|| EventKind::Other(raw.to_string()))
    }

    /// Terminal run events.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            EventKind::RunComplete | EventKind::RunCancel | EventKind::RunError
        )
    }
}

/// Lifecycle state shared by tools, actions and plan tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[default]
    Init,
    Running,
    Done,
    Failed,
}

impl EntryState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "init" | "pending" | "queued" | "waiting" | "todo" | "not_started" => {
                Some(EntryState::Init)
            }
            "running" | "in_progress" | "active" | "started" | "processing" => {
                Some(EntryState::Running)
            }
            "done" | "complete" | "completed" | "success" | "succeeded" | "ok" | "cancelled"
            | "canceled" | "skipped" => Some(EntryState::Done),
            "failed" | "fail" | "error" | "failure" => Some(EntryState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Done | EntryState::Failed)
    }
}

/// Explicit `status` field, if it parses.
pub fn status_field(event: &Value) -> Option<EntryState> {
    event
        .get("status")
        .and_then(Value::as_str)
        .and_then(EntryState::parse)
}

/// True when the event carries a non-null, non-empty `error`.
pub fn has_error(event: &Value) -> bool {
    match event.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Non-empty string field.
pub fn str_field<'a>(event: &'a Value, key: &str) -> Option<&'a str> {
    event
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Id field that may arrive as a string or a number.
pub fn id_field(event: &Value, key: &str) -> Option<String> {
    match event.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty string among `keys`.
pub fn first_str<'a>(event: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| str_field(event, k))
}

/// Text to append for a delta event.
pub fn delta_text(event: &Value) -> Option<&str> {
    ["delta", "text", "content"]
        .iter()
        .find_map(|k| event.get(*k).and_then(Value::as_str))
}

/// Full text carried by a start/snapshot event.
pub fn full_text(event: &Value) -> Option<&str> {
    ["text", "content", "delta"]
        .iter()
        .find_map(|k| event.get(*k).and_then(Value::as_str))
}

/// Renders any JSON value as display text; strings are taken verbatim.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub const TOOL_LABEL_KEYS: &[&str] = &["toolLabel", "label", "toolName", "toolKey", "toolType"];
pub const ACTION_LABEL_KEYS: &[&str] = &["actionLabel", "label", "actionName"];

pub fn tool_label(event: &Value) -> String {
    first_str(event, TOOL_LABEL_KEYS)
        .unwrap_or("Tool")
        .to_string()
}

pub fn action_label(event: &Value) -> String {
    first_str(event, ACTION_LABEL_KEYS)
        .unwrap_or("Action")
        .to_string()
}

/// Display text for a `run.error` payload.
pub fn run_error_text(event: &Value) -> String {
    let detail = match event.get("error") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Object(obj)) => ["message", "msg", "detail"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(ToString::to_string)
            .or_else(|| Some(Value::Object(obj.clone()).to_string())),
        _ => None,
    }
    .or_else(|| str_field(event, "message").map(ToString::to_string));
    match detail {
        Some(detail) => format!("Run failed: {detail}"),
        None => "Run failed".to_string(),
    }
}
