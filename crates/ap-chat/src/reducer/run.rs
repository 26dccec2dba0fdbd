use super::Step;
use crate::effects::ChatEffect;
use crate::events::{EventKind, id_field, run_error_text};
use crate::runtime_maps::RuntimeMaps;
use crate::state::{ChatState, EntryKind, MessageEntry, MessageVariant, Role};

pub(super) fn start(maps: &mut RuntimeMaps, step: &Step<'_>) {
    if let Some(run_id) = id_field(step.event, "runId") {
        maps.run_id = Some(run_id);
    }
}

/// Terminal run events. The `run_end` row is keyed by run id, so a repeated
/// terminal event updates it in place.
pub(super) fn finish(
    state: &mut ChatState,
    maps: &mut RuntimeMaps,
    step: &mut Step<'_>,
    kind: &EventKind,
) {
    let run_id = id_field(step.event, "runId")
        .or_else(|| maps.run_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    state.streaming = false;
    state.active_frontend_tool = None;
    for entry in &mut state.timeline {
        if let EntryKind::Message(message) = &mut entry.kind {
            message.is_streaming_content = false;
        }
    }

    let text = match kind {
        EventKind::RunCancel => "Run cancelled",
        EventKind::RunError => "Run failed",
        _ => "Run completed",
    };
    let entry = state.entry_or_insert_with(&format!("run-end-{run_id}"), step.ts, || {
        EntryKind::Message(MessageEntry {
            variant: Some(MessageVariant::RunEnd),
            ..MessageEntry::new(Role::System)
        })
    });
    if let EntryKind::Message(message) = &mut entry.kind {
        message.text = text.to_string();
    }

    if *kind == EventKind::RunError {
        let error = run_error_text(step.event);
        let id = maps.next_id("msg");
        state.entry_or_insert_with(&id, step.ts, || {
            EntryKind::Message(MessageEntry {
                text: error.clone(),
                variant: Some(MessageVariant::RunError),
                ..MessageEntry::new(Role::System)
            })
        });
        state.status_text = Some(error);
    } else {
        state.status_text = None;
    }

    if step.is_live() {
        step.effects.push(ChatEffect::StreamEnd);
    }
}
