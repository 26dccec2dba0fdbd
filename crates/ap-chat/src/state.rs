//! Chat state snapshot.
//!
//! `ChatState` is everything a view needs to render one open chat. The
//! reducer takes it by value and hands back the next one; nothing else
//! mutates it except the runtime's own UI-only toggles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EntryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageVariant {
    /// One per run; upserted on terminal run events.
    RunEnd,
    /// Rendered `run.error` payload.
    RunError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub role: Role,
    pub text: String,
    pub variant: Option<MessageVariant>,
    pub is_streaming_content: bool,
}

impl MessageEntry {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            text: String::new(),
            variant: None,
            is_streaming_content: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_id: String,
    pub tool_key: Option<String>,
    pub tool_type: Option<String>,
    pub label: String,
    pub args_text: String,
    /// Parsed arguments, once the buffer is valid JSON.
    pub params: Option<Value>,
    pub result_text: String,
    pub error: Option<String>,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub action_id: String,
    pub action_name: Option<String>,
    pub label: String,
    pub description: Option<String>,
    pub args_text: String,
    pub result_text: String,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningEntry {
    pub text: String,
    pub collapsed: bool,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Message(MessageEntry),
    Tool(ToolEntry),
    Action(ActionEntry),
    Reasoning(ReasoningEntry),
}

/// One row of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: String,
    pub ts: i64,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl TimelineEntry {
    pub fn as_message(&self) -> Option<&MessageEntry> {
        match &self.kind {
            EntryKind::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolEntry> {
        match &self.kind {
            EntryKind::Tool(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_action(&self) -> Option<&ActionEntry> {
        match &self.kind {
            EntryKind::Action(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_reasoning(&self) -> Option<&ReasoningEntry> {
        match &self.kind {
            EntryKind::Reasoning(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTask {
    pub task_id: String,
    pub description: String,
    pub status: EntryState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanState {
    pub plan_id: Option<String>,
    pub tasks: Vec<PlanTask>,
    pub expanded: bool,
    pub last_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub current: usize,
    pub total: usize,
}

/// Position of the plan.
///
/// With a running task, `current` is its 1-based position; otherwise it is
/// the number of finished tasks.
pub fn plan_progress(plan: &PlanState) -> PlanProgress {
    let total = plan.tasks.len();
    let current = plan
        .tasks
        .iter()
        .position(|t| t.status == EntryState::Running)
        .map_or_else(
            || plan.tasks.iter().filter(|t| t.status.is_terminal()).count(),
            |idx| idx + 1,
        );
    PlanProgress { current, total }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Webview,
    NativeConfirmDialog,
}

/// The one tool currently waiting on user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendToolState {
    pub run_id: String,
    pub tool_id: String,
    pub tool_key: Option<String>,
    pub tool_type: Option<String>,
    pub tool_name: Option<String>,
    pub render_mode: RenderMode,
    /// Milliseconds the backend will wait for a submission.
    pub tool_timeout: Option<u64>,
    pub tool_params: Option<Value>,
    pub params_ready: bool,
    pub params_error: Option<String>,
    pub args_text: String,
    pub missing_chunk_indexes: Vec<u64>,
    pub chunk_gap_detected: bool,
    pub tool_init_dispatched: bool,
    pub user_interacted: bool,
    pub init_attempt: u32,
    pub init_last_sent_at_ms: Option<i64>,
    pub viewport_html: Option<String>,
    pub loading: bool,
    pub load_error: Option<String>,
}

/// Modal opened by a `show_modal` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionModal {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub timeline: Vec<TimelineEntry>,
    pub plan_state: Option<PlanState>,
    pub active_frontend_tool: Option<FrontendToolState>,
    pub action_modal: Option<ActionModal>,
    pub chat_id: Option<String>,
    pub status_text: Option<String>,
    pub streaming: bool,
    /// Tool entry id to expanded flag.
    pub expanded_tools: BTreeMap<String, bool>,
}

impl ChatState {
    pub fn for_chat(chat_id: Option<String>) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }

    pub fn entry(&self, id: &str) -> Option<&TimelineEntry> {
        self.timeline.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: &str) -> Option<&mut TimelineEntry> {
        self.timeline.iter_mut().find(|e| e.id == id)
    }

    /// Returns the entry with `id`, appending `create()` if it is missing.
    pub fn entry_or_insert_with(
        &mut self,
        id: &str,
        ts: i64,
        create: impl FnOnce() -> EntryKind,
    ) -> &mut TimelineEntry {
        let index = match self.timeline.iter().position(|e| e.id == id) {
            Some(index) => index,
            None => {
                self.timeline.push(TimelineEntry {
                    id: id.to_string(),
                    ts,
                    kind: create(),
                });
                self.timeline.len() - 1
            }
        };
        &mut self.timeline[index]
    }

    pub fn messages(&self) -> impl Iterator<Item = (&TimelineEntry, &MessageEntry)> {
        self.timeline
            .iter()
            .filter_map(|e| e.as_message().map(|m| (e, m)))
    }

    pub fn progress(&self) -> Option<PlanProgress> {
        self.plan_state.as_ref().map(plan_progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(statuses: &[EntryState]) -> PlanState {
        PlanState {
            tasks: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| PlanTask {
                    task_id: format!("t{i}"),
                    description: String::new(),
                    status: *status,
                })
                .collect(),
            ..PlanState::default()
        }
    }

    #[test]
    fn test_plan_progress_counts_running_task() {
        let p = plan(&[EntryState::Done, EntryState::Running, EntryState::Init]);
        assert_eq!(plan_progress(&p), PlanProgress { current: 2, total: 3 });
    }

    #[test]
    fn test_plan_progress_all_done() {
        let p = plan(&[EntryState::Done, EntryState::Done, EntryState::Failed]);
        assert_eq!(plan_progress(&p), PlanProgress { current: 3, total: 3 });
    }

    #[test]
    fn test_plan_progress_uses_running_position() {
        let p = plan(&[EntryState::Init, EntryState::Running, EntryState::Done]);
        assert_eq!(plan_progress(&p), PlanProgress { current: 2, total: 3 });
    }

    #[test]
    fn test_plan_progress_empty() {
        assert_eq!(
            plan_progress(&PlanState::default()),
            PlanProgress { current: 0, total: 0 }
        );
    }

    #[test]
    fn test_entry_or_insert_with_reuses_existing() {
        let mut state = ChatState::default();
        state
            .entry_or_insert_with("a", 1, || EntryKind::Message(MessageEntry::new(Role::User)))
            .ts = 5;
        state.entry_or_insert_with("a", 9, || unreachable!());
        assert_eq!(state.timeline.len(), 1);
        assert_eq!(state.timeline[0].ts, 5);
    }
}
