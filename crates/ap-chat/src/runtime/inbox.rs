//! Inbox channel types.
//!
//! Every spawned task reports back through one unbounded channel. Messages
//! carry the chat epoch they were started under so the runtime can drop
//! anything that belongs to a chat it has since switched away from.

use ap_core::sse::MalformedReason;
use serde_json::Value;
use tokio::sync::mpsc;

/// How a query stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { events: usize },
    /// Cancelled by the runtime; never shown to the user.
    Aborted,
    Failed(String),
}

#[derive(Debug)]
pub enum ChatEvent {
    /// One parsed stream event.
    StreamEvent { epoch: u64, event: Value },
    /// A frame that could not be parsed.
    StreamMalformed { epoch: u64, reason: MalformedReason },
    /// Terminal message of a query stream task.
    StreamFinished { epoch: u64, outcome: StreamOutcome },
    /// Terminal message of a viewport load task.
    ViewportLoaded {
        epoch: u64,
        tool_id: String,
        result: Result<String, String>,
    },
}

impl ChatEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            ChatEvent::StreamEvent { epoch, .. }
            | ChatEvent::StreamMalformed { epoch, .. }
            | ChatEvent::StreamFinished { epoch, .. }
            | ChatEvent::ViewportLoaded { epoch, .. } => *epoch,
        }
    }

    /// True for the final message a spawned task sends.
    pub fn ends_task(&self) -> bool {
        matches!(
            self,
            ChatEvent::StreamFinished { .. } | ChatEvent::ViewportLoaded { .. }
        )
    }
}

pub type ChatEventSender = mpsc::UnboundedSender<ChatEvent>;
pub type ChatEventReceiver = mpsc::UnboundedReceiver<ChatEvent>;
