//! Chat event reducer.
//!
//! `reduce(prev, event, source, maps)` folds one backend event into the next
//! [`ChatState`] and returns the effects the runtime must execute. It never
//! performs I/O; the only side channel is [`RuntimeMaps`], which carries the
//! correlation-id index and per-tool scratch buffers across calls.
//!
//! Events are applied strictly in delivery order. Every sub-entity is created
//! lazily, so a snapshot or delta may be the first event seen for an id.

mod content;
mod plan;
mod reasoning;
mod run;
mod tools;

use ap_core::time;
use serde_json::Value;

use crate::effects::ChatEffect;
use crate::events::{EventKind, id_field};
use crate::runtime_maps::RuntimeMaps;
use crate::state::ChatState;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Arriving on the open stream.
    Live,
    /// Replayed from the chat history endpoint or the local cache.
    History,
}

/// Output of one reducer call.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub state: ChatState,
    pub effects: Vec<ChatEffect>,
}

/// Per-call context shared by the sub-reducers.
pub(crate) struct Step<'a> {
    pub event: &'a Value,
    pub source: EventSource,
    /// Effective timestamp, epoch millis.
    pub ts: i64,
    pub effects: Vec<ChatEffect>,
}

impl Step<'_> {
    pub fn is_live(&self) -> bool {
        self.source == EventSource::Live
    }
}

/// Reduces one event using the wall clock for events without a timestamp.
pub fn reduce(
    prev: ChatState,
    event: &Value,
    source: EventSource,
    maps: &mut RuntimeMaps,
) -> Reduction {
    reduce_at(prev, event, source, maps, time::now_millis())
}

/// Reduces one event; `now_ms` stands in for a missing timestamp.
pub fn reduce_at(
    prev: ChatState,
    event: &Value,
    source: EventSource,
    maps: &mut RuntimeMaps,
    now_ms: i64,
) -> Reduction {
    let mut state = prev;
    let mut step = Step {
        event,
        source,
        ts: time::event_timestamp(event).unwrap_or(now_ms),
        effects: Vec::new(),
    };

    if !event.is_object() {
        tracing::debug!("Ignoring non-object chat event");
        return Reduction {
            state,
            effects: step.effects,
        };
    }

    if let Some(chat_id) = id_field(event, "chatId") {
        state.chat_id = Some(chat_id.clone());
        step.effects.push(ChatEffect::SetChatId { chat_id });
    }

    let kind = EventKind::of(event);
    if !kind.ends_run()
        && let Some(run_id) = id_field(event, "runId")
    {
        maps.run_id = Some(run_id);
    }
    if step.is_live() && !kind.ends_run() && !matches!(kind, EventKind::Other(_)) {
        state.streaming = true;
    }

    match &kind {
        EventKind::RequestQuery => content::request_query(&mut state, maps, &step),
        EventKind::ContentStart
        | EventKind::ContentDelta
        | EventKind::ContentSnapshot
        | EventKind::ContentEnd => content::apply(&mut state, maps, &step, &kind),
        EventKind::ToolStart
        | EventKind::ToolSnapshot
        | EventKind::ToolArgs
        | EventKind::ToolResult
        | EventKind::ToolEnd => tools::apply_tool(&mut state, maps, &mut step, &kind),
        EventKind::ActionStart
        | EventKind::ActionSnapshot
        | EventKind::ActionArgs
        | EventKind::ActionResult
        | EventKind::ActionEnd => tools::apply_action(&mut state, maps, &mut step, &kind),
        EventKind::ReasoningStart
        | EventKind::ReasoningDelta
        | EventKind::ReasoningSnapshot
        | EventKind::ReasoningEnd => reasoning::apply(&mut state, maps, &step, &kind),
        EventKind::PlanUpdate => plan::update(&mut state, &step),
        EventKind::TaskStart
        | EventKind::TaskEnd
        | EventKind::TaskComplete
        | EventKind::TaskFail
        | EventKind::TaskCancel => plan::patch_task(&mut state, &step, &kind),
        EventKind::RunStart => run::start(maps, &step),
        EventKind::RunComplete | EventKind::RunCancel | EventKind::RunError => {
            run::finish(&mut state, maps, &mut step, &kind);
        }
        EventKind::Other(raw) => tracing::trace!(event_type = %raw, "Ignoring unrecognized chat event"),
    }

    Reduction {
        state,
        effects: step.effects,
    }
}

/// Correlation key with a fallback to the event's run, then the current run.
pub(crate) fn correlation_key(
    event: &Value,
    keys: &[&str],
    maps: &RuntimeMaps,
    fallback: &str,
) -> String {
    keys.iter()
        .find_map(|k| id_field(event, k))
        .or_else(|| {
            id_field(event, "runId")
                .or_else(|| maps.run_id.clone())
                .map(|run| format!("run:{run}"))
        })
        .unwrap_or_else(|| fallback.to_string())
}
