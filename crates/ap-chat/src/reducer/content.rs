use serde_json::Value;

use super::{Step, correlation_key};
use crate::events::{EventKind, delta_text, first_str, full_text, id_field};
use crate::runtime_maps::{Family, RuntimeMaps};
use crate::state::{ChatState, EntryKind, MessageEntry, Role};

fn role_of(event: &Value) -> Role {
    match event.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("system") => Role::System,
        _ => Role::Assistant,
    }
}

pub(super) fn apply(state: &mut ChatState, maps: &mut RuntimeMaps, step: &Step<'_>, kind: &EventKind) {
    let key = correlation_key(step.event, &["contentId"], maps, "content");
    let id = maps.entry_id(Family::Content, &key);
    let role = role_of(step.event);
    let entry = state.entry_or_insert_with(&id, step.ts, || {
        EntryKind::Message(MessageEntry::new(role))
    });
    let EntryKind::Message(message) = &mut entry.kind else {
        return;
    };

    match kind {
        EventKind::ContentStart => {
            if let Some(seed) = full_text(step.event).filter(|t| !t.is_empty()) {
                message.text = seed.to_string();
            }
            message.is_streaming_content = step.is_live();
        }
        EventKind::ContentDelta => {
            if let Some(delta) = delta_text(step.event) {
                message.text.push_str(delta);
            }
            message.is_streaming_content = step.is_live();
        }
        EventKind::ContentSnapshot => {
            if let Some(text) = full_text(step.event) {
                message.text = text.to_string();
            }
            message.is_streaming_content = false;
        }
        EventKind::ContentEnd => {
            if message.text.is_empty()
                && let Some(text) = full_text(step.event)
            {
                message.text = text.to_string();
            }
            message.is_streaming_content = false;
        }
        _ => {}
    }
}

/// The user's own message, keyed by `requestId` so the local echo and the
/// backend copy collapse into one entry.
pub(super) fn request_query(state: &mut ChatState, maps: &mut RuntimeMaps, step: &Step<'_>) {
    let text = first_str(step.event, &["message", "text", "content", "query"]).unwrap_or_default();
    let id = match id_field(step.event, "requestId") {
        Some(request_id) => maps.entry_id(Family::Content, &format!("request:{request_id}")),
        None => maps.next_id("msg"),
    };
    let entry = state.entry_or_insert_with(&id, step.ts, || {
        EntryKind::Message(MessageEntry::new(Role::User))
    });
    if let EntryKind::Message(message) = &mut entry.kind {
        message.text = text.to_string();
    }
}
