use super::{Step, correlation_key};
use crate::events::{EventKind, delta_text, full_text};
use crate::runtime_maps::{Family, RuntimeMaps};
use crate::state::{ChatState, EntryKind, ReasoningEntry};

/// Reasoning blocks correlate by `reasoningId`, then `runId`, then
/// `contentId`.
pub(super) fn apply(state: &mut ChatState, maps: &mut RuntimeMaps, step: &Step<'_>, kind: &EventKind) {
    let key = correlation_key(
        step.event,
        &["reasoningId", "runId", "contentId"],
        maps,
        "reasoning",
    );
    let id = maps.entry_id(Family::Reasoning, &key);
    let ts = step.ts;
    let entry = state.entry_or_insert_with(&id, ts, || {
        EntryKind::Reasoning(ReasoningEntry {
            text: String::new(),
            collapsed: false,
            start_ts: ts,
            end_ts: None,
        })
    });
    let EntryKind::Reasoning(reasoning) = &mut entry.kind else {
        return;
    };

    match kind {
        EventKind::ReasoningStart => {
            if let Some(seed) = full_text(step.event).filter(|t| !t.is_empty()) {
                reasoning.text = seed.to_string();
            }
        }
        EventKind::ReasoningDelta => {
            if let Some(delta) = delta_text(step.event) {
                reasoning.text.push_str(delta);
            }
        }
        EventKind::ReasoningEnd => {
            if reasoning.text.is_empty()
                && let Some(text) = full_text(step.event)
            {
                reasoning.text = text.to_string();
            }
            reasoning.end_ts = Some(ts);
        }
        EventKind::ReasoningSnapshot => {
            if let Some(text) = full_text(step.event) {
                reasoning.text = text.to_string();
            }
            reasoning.collapsed = true;
            reasoning.end_ts.get_or_insert(ts);
        }
        _ => {}
    }
}
