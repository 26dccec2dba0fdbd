//! Effect handlers for the chat runtime.
//!
//! Handlers are async functions that perform the network work and return a
//! `ChatEvent`. They never touch `ChatState`; the runtime spawns them and
//! folds their results in through the inbox.

use anyhow::{Context, Result};
use ap_core::ApClient;
use ap_core::backend::QueryRequest;
use ap_core::cache::{ChatCache, ChatSummary, max_last_run_id};
use ap_core::sse;
use tokio_util::sync::CancellationToken;

use super::inbox::{ChatEvent, ChatEventSender, StreamOutcome};

/// Opens the query stream and forwards every event to the inbox.
///
/// Returns the terminal `StreamFinished` message.
pub async fn query_stream(
    api: ApClient,
    query: QueryRequest,
    cancel: CancellationToken,
    tx: ChatEventSender,
    epoch: u64,
) -> ChatEvent {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return finished(epoch, StreamOutcome::Aborted),
        opened = api.open_query_stream(&query) => opened,
    };
    let response = match opened {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, request_id = %query.request_id, "Failed to open query stream");
            return finished(epoch, StreamOutcome::Failed(err.to_string()));
        }
    };

    let result = sse::read_event_stream(
        response,
        &cancel,
        |event| {
            let _ = tx.send(ChatEvent::StreamEvent { epoch, event });
        },
        |raw, reason| {
            tracing::debug!(reason = reason.as_str(), frame_len = raw.len(), "Malformed stream frame");
            let _ = tx.send(ChatEvent::StreamMalformed { epoch, reason });
        },
    )
    .await;

    let outcome = match result {
        Ok(events) => StreamOutcome::Completed { events },
        Err(err) if err.is_aborted() => StreamOutcome::Aborted,
        Err(err) => {
            tracing::warn!(error = %err, "Query stream failed");
            StreamOutcome::Failed(err.to_string())
        }
    };
    finished(epoch, outcome)
}

fn finished(epoch: u64, outcome: StreamOutcome) -> ChatEvent {
    ChatEvent::StreamFinished { epoch, outcome }
}

/// Fetches the HTML for a webview tool.
pub async fn viewport_load(
    api: ApClient,
    viewport_key: String,
    tool_id: String,
    epoch: u64,
) -> ChatEvent {
    let result = api
        .fetch_viewport(&viewport_key)
        .await
        .map_err(|e| e.to_string());
    ChatEvent::ViewportLoaded {
        epoch,
        tool_id,
        result,
    }
}

/// Pulls chats newer than the cached cursor into the cache.
///
/// Returns the full cached list after the merge.
///
/// # Errors
/// Returns an error if the cache cannot be read or written, or the list
/// request fails.
pub async fn sync_chat_list(api: &ApClient, cache: &dyn ChatCache) -> Result<Vec<ChatSummary>> {
    let cached = cache.list_cached_chats()?;
    let cursor = max_last_run_id(&cached);
    let fresh = api
        .list_chats(cursor.as_deref())
        .await
        .context("Failed to fetch chat list")?;
    tracing::debug!(
        cursor = cursor.as_deref().unwrap_or(""),
        fetched = fresh.len(),
        "Synced chat list"
    );
    if !fresh.is_empty() {
        cache.upsert_chat_summaries(&fresh)?;
    }
    cache.list_cached_chats()
}
