//! Chat runtime: owns one open chat, runs its stream, executes effects.
//!
//! This is the boundary where side effects happen. The reducer stays pure
//! and returns effects; this module executes them against the network, the
//! local cache and the embedding [`ChatHost`].
//!
//! ## Inbox Pattern
//!
//! Spawned work reports back through a single inbox:
//! - Handlers send `ChatEvent`s to `inbox_tx`
//! - The runtime drains `inbox_rx` in [`ChatRuntime::step`]
//! - Every message carries the chat epoch it was started under
//!
//! ## Chat Switching
//!
//! [`ChatRuntime::switch_chat`] is synchronous: it cancels the live stream,
//! bumps the epoch, and replaces the state, maps and timers before any
//! await point. Messages from the previous epoch that are still queued are
//! dropped unread.
//!
//! Structure:
//! - `mod.rs`: `ChatRuntime`, effect dispatch, timers
//! - `inbox.rs`: Inbox channel types
//! - `handlers.rs`: Async network handlers

pub mod handlers;
mod inbox;

use std::collections::HashMap;
use std::mem;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ap_core::ApClient;
use ap_core::backend::{QueryRequest, SubmitOutcome};
use ap_core::cache::{ChatCache, ChatDetail};
use ap_core::config::Config;
use ap_core::time::now_millis;
pub use inbox::{ChatEvent, ChatEventReceiver, ChatEventSender, StreamOutcome};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::effects::ChatEffect;
use crate::frontend_tool::{self, ViewMessage};
use crate::host::ChatHost;
use crate::reducer::{EventSource, Reduction, reduce};
use crate::runtime_maps::RuntimeMaps;
use crate::state::{ActionModal, ChatState, EntryKind, RenderMode};

/// Action handled by the runtime itself rather than the host.
pub const SHOW_MODAL_ACTION: &str = "show_modal";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub agent_key: String,
    /// `streaming` flips false after this long without stream activity.
    pub stream_idle_timeout: Duration,
    /// Ended reasoning blocks collapse after this delay.
    pub reasoning_collapse_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_key: config.agent_key.clone(),
            stream_idle_timeout: Duration::from_millis(config.chat.stream_idle_timeout_ms),
            reasoning_collapse_delay: Duration::from_millis(config.chat.reasoning_collapse_delay_ms),
        }
    }
}

/// Where a loaded history came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Network,
    Cache,
}

pub struct ChatRuntime {
    api: ApClient,
    cache: Arc<dyn ChatCache>,
    host: Box<dyn ChatHost>,
    options: RuntimeOptions,

    state: ChatState,
    maps: RuntimeMaps,
    /// Bumped on every chat switch; inbox messages from older epochs are dropped.
    epoch: u64,
    bound_chat_id: Option<String>,

    stream_cancel: Option<CancellationToken>,
    /// Spawned tasks that have not yet sent their terminal message.
    pending_tasks: usize,
    idle_deadline_ms: Option<i64>,
    /// Reasoning entry id to collapse deadline.
    collapse_deadlines: HashMap<String, i64>,

    inbox_tx: ChatEventSender,
    inbox_rx: ChatEventReceiver,
}

impl ChatRuntime {
    pub fn new(
        api: ApClient,
        cache: Arc<dyn ChatCache>,
        host: Box<dyn ChatHost>,
        options: RuntimeOptions,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            api,
            cache,
            host,
            options,
            state: ChatState::default(),
            maps: RuntimeMaps::new(),
            epoch: 0,
            bound_chat_id: None,
            stream_cancel: None,
            pending_tasks: 0,
            idle_deadline_ms: None,
            collapse_deadlines: HashMap::new(),
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while a query stream task is running.
    pub fn is_stream_open(&self) -> bool {
        self.stream_cancel.is_some()
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.pending_tasks > 0
    }

    /// Sender for injecting inbox messages (used by embedders that drive
    /// their own streams).
    pub fn inbox_sender(&self) -> ChatEventSender {
        self.inbox_tx.clone()
    }

    // ========================================================================
    // Chat lifecycle
    // ========================================================================

    /// Resets everything for `chat_id` (or a new, unbound chat).
    pub fn switch_chat(&mut self, chat_id: Option<&str>) {
        self.abort_stream();
        self.epoch += 1;
        self.maps = RuntimeMaps::new();
        self.state = ChatState::for_chat(chat_id.map(ToString::to_string));
        self.bound_chat_id = self.state.chat_id.clone();
        self.idle_deadline_ms = None;
        self.collapse_deadlines.clear();
        tracing::debug!(epoch = self.epoch, chat_id = chat_id.unwrap_or(""), "Switched chat");
    }

    /// Switches to `chat_id` and loads its history.
    ///
    /// # Errors
    /// Returns an error if neither the backend nor the cache has the chat.
    pub async fn open_chat(&mut self, chat_id: &str) -> Result<HistorySource> {
        self.switch_chat(Some(chat_id));
        self.load_history().await
    }

    /// Replays the current chat's history, falling back to the local cache
    /// when the backend is unreachable.
    ///
    /// # Errors
    /// Returns an error if no chat is selected, or the fetch failed and the
    /// cache has nothing for this chat.
    pub async fn load_history(&mut self) -> Result<HistorySource> {
        let chat_id = self
            .state
            .chat_id
            .clone()
            .context("No chat selected")?;

        match self.api.fetch_chat(&chat_id).await {
            Ok(history) => {
                self.replay(&history.events);
                let detail = ChatDetail {
                    chat_id: history.chat_id,
                    chat_name: history.chat_name,
                    chat_image_token: history.chat_image_token,
                    events: history.events,
                    last_sync_ms: now_millis(),
                };
                if let Err(e) = self.cache.upsert_chat_detail(&detail) {
                    tracing::warn!(chat_id = %chat_id, "Failed to cache chat history: {e:#}");
                }
                Ok(HistorySource::Network)
            }
            Err(err) => {
                tracing::warn!(chat_id = %chat_id, error = %err, "History fetch failed; trying cache");
                let cached = self
                    .cache
                    .get_cached_chat_detail(&chat_id)
                    .context("Failed to read cached chat")?;
                let Some(detail) = cached else {
                    return Err(err).with_context(|| format!("Failed to load chat {chat_id}"));
                };
                self.replay(&detail.events);
                self.state.status_text = Some(format!("Showing cached history ({err})"));
                Ok(HistorySource::Cache)
            }
        }
    }

    fn replay(&mut self, events: &[Value]) {
        for event in events {
            self.apply(event, EventSource::History);
        }
        self.state.streaming = false;
        for entry in &mut self.state.timeline {
            if let EntryKind::Reasoning(reasoning) = &mut entry.kind
                && reasoning.end_ts.is_some()
            {
                reasoning.collapsed = true;
            }
        }
    }

    /// Posts a user message and starts streaming the reply.
    ///
    /// The message is added to the timeline before the request is sent.
    /// Returns the request id.
    ///
    /// # Errors
    /// Returns an error if the message is empty or a reply is still streaming.
    pub fn send_message(&mut self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Message is empty");
        }
        if self.is_stream_open() {
            bail!("A reply is still streaming");
        }

        let request_id = Uuid::new_v4().to_string();
        let echo = json!({
            "type": "request.query",
            "requestId": request_id,
            "message": text,
            "timestamp": now_millis(),
        });
        self.apply(&echo, EventSource::Live);
        self.state.status_text = None;

        let query = QueryRequest {
            request_id: request_id.clone(),
            chat_id: self.state.chat_id.clone(),
            message: text.to_string(),
            agent_key: self.options.agent_key.clone(),
        };
        let cancel = CancellationToken::new();
        self.stream_cancel = Some(cancel.clone());
        self.reset_idle_deadline(now_millis());

        let api = self.api.clone();
        let tx = self.inbox_tx.clone();
        let epoch = self.epoch;
        self.spawn_effect(move || handlers::query_stream(api, query, cancel, tx, epoch));
        Ok(request_id)
    }

    /// Cancels the live stream, if any. The stream task reports `Aborted`.
    pub fn abort_stream(&mut self) {
        if let Some(cancel) = self.stream_cancel.take() {
            cancel.cancel();
        }
    }

    /// Aborts the stream and retires the current epoch.
    pub fn close(&mut self) {
        self.abort_stream();
        self.epoch += 1;
        self.idle_deadline_ms = None;
        self.collapse_deadlines.clear();
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Waits for the next inbox message or timer and handles it.
    ///
    /// Returns false when there is nothing left to wait for.
    pub async fn step(&mut self) -> bool {
        let deadline = self.next_deadline_ms();
        if self.pending_tasks == 0 && deadline.is_none() {
            return false;
        }
        let wait = deadline.map(|d| Duration::from_millis((d - now_millis()).max(0) as u64));
        tokio::select! {
            event = self.inbox_rx.recv() => match event {
                Some(event) => self.process(event),
                None => return false,
            },
            () = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                self.tick(now_millis());
            }
        }
        true
    }

    /// Runs until every spawned task has reported back.
    pub async fn run_until_idle(&mut self) {
        while self.pending_tasks > 0 && self.step().await {}
    }

    /// Handles one inbox message.
    pub fn process(&mut self, event: ChatEvent) {
        if event.ends_task() {
            self.pending_tasks = self.pending_tasks.saturating_sub(1);
        }
        if event.epoch() != self.epoch {
            tracing::debug!(event_epoch = event.epoch(), epoch = self.epoch, "Dropping stale chat event");
            return;
        }

        match event {
            ChatEvent::StreamEvent { event, .. } => {
                let now = now_millis();
                self.reset_idle_deadline(now);
                self.apply(&event, EventSource::Live);
                self.schedule_reasoning_collapse(now);
            }
            ChatEvent::StreamMalformed { reason, .. } => {
                tracing::debug!(reason = reason.as_str(), "Skipped malformed stream frame");
            }
            ChatEvent::StreamFinished { outcome, .. } => {
                self.stream_cancel = None;
                match outcome {
                    StreamOutcome::Completed { events } => {
                        tracing::debug!(events, "Query stream completed");
                    }
                    StreamOutcome::Aborted => {}
                    StreamOutcome::Failed(message) => {
                        self.state.status_text = Some(message);
                        self.state.streaming = false;
                        self.idle_deadline_ms = None;
                    }
                }
            }
            ChatEvent::ViewportLoaded {
                tool_id, result, ..
            } => {
                let Some(tool) = self
                    .state
                    .active_frontend_tool
                    .as_mut()
                    .filter(|t| t.tool_id == tool_id)
                else {
                    return;
                };
                tool.loading = false;
                match result {
                    Ok(html) => tool.viewport_html = Some(html),
                    Err(e) => {
                        tracing::warn!(tool_id = %tool_id, "Viewport load failed: {e}");
                        tool.load_error = Some(e);
                    }
                }
                self.try_dispatch_tool_init();
            }
        }
    }

    /// Fires due timers: stream idle and reasoning collapse.
    pub fn tick(&mut self, now_ms: i64) {
        if let Some(deadline) = self.idle_deadline_ms
            && now_ms >= deadline
        {
            self.idle_deadline_ms = None;
            if self.state.streaming {
                tracing::debug!("Stream idle");
                self.state.streaming = false;
            }
        }

        let due: Vec<String> = self
            .collapse_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.collapse_deadlines.remove(&id);
            if let Some(entry) = self.state.entry_mut(&id)
                && let EntryKind::Reasoning(reasoning) = &mut entry.kind
            {
                reasoning.collapsed = true;
            }
        }
    }

    fn next_deadline_ms(&self) -> Option<i64> {
        self.collapse_deadlines
            .values()
            .copied()
            .chain(self.idle_deadline_ms)
            .min()
    }

    fn reset_idle_deadline(&mut self, now_ms: i64) {
        self.idle_deadline_ms =
            Some(now_ms + self.options.stream_idle_timeout.as_millis() as i64);
    }

    fn schedule_reasoning_collapse(&mut self, now_ms: i64) {
        let at = now_ms + self.options.reasoning_collapse_delay.as_millis() as i64;
        for entry in &self.state.timeline {
            if let EntryKind::Reasoning(reasoning) = &entry.kind
                && reasoning.end_ts.is_some()
                && !reasoning.collapsed
            {
                self.collapse_deadlines.entry(entry.id.clone()).or_insert(at);
            }
        }
    }

    // ========================================================================
    // Effect dispatch
    // ========================================================================

    fn apply(&mut self, event: &Value, source: EventSource) {
        let prev = mem::take(&mut self.state);
        let Reduction { state, effects } = reduce(prev, event, source, &mut self.maps);
        self.state = state;
        self.execute_effects(effects);
    }

    fn execute_effects(&mut self, effects: Vec<ChatEffect>) {
        for effect in effects {
            self.execute_effect(effect);
        }
    }

    fn execute_effect(&mut self, effect: ChatEffect) {
        match effect {
            ChatEffect::SetChatId { chat_id } => {
                if self.bound_chat_id.as_deref() != Some(chat_id.as_str()) {
                    tracing::debug!(chat_id = %chat_id, "Chat id bound");
                    self.host.chat_id_bound(&chat_id);
                    self.bound_chat_id = Some(chat_id);
                }
            }
            ChatEffect::ExecuteAction {
                action_id,
                action_name,
                args,
            } => {
                tracing::debug!(action_id = %action_id, action = %action_name, "Executing action");
                if action_name == SHOW_MODAL_ACTION {
                    let text = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default();
                    self.state.action_modal = Some(ActionModal {
                        title: text("title").to_string(),
                        content: text("content").to_string(),
                    });
                } else {
                    self.host.execute_action(&action_name, &args);
                }
            }
            ChatEffect::StreamEnd => self.idle_deadline_ms = None,
            ChatEffect::ActivateFrontendTool {
                tool_id,
                tool_key,
                render_mode,
                ..
            } => {
                if self.state.active_frontend_tool.is_none() {
                    return;
                }
                tracing::debug!(tool_id = %tool_id, ?render_mode, "Frontend tool activated");
                if render_mode == RenderMode::Webview {
                    match tool_key {
                        Some(viewport_key) => {
                            let api = self.api.clone();
                            let epoch = self.epoch;
                            self.spawn_effect(move || {
                                handlers::viewport_load(api, viewport_key, tool_id, epoch)
                            });
                        }
                        None => {
                            if let Some(tool) = self.state.active_frontend_tool.as_mut() {
                                tool.loading = false;
                                tool.load_error = Some("Tool has no viewport key".to_string());
                            }
                        }
                    }
                }
                if let Some(tool) = &self.state.active_frontend_tool {
                    self.host.frontend_tool_activated(tool);
                }
                self.try_dispatch_tool_init();
            }
            ChatEffect::FrontendToolParamsReady { tool_id, .. } => {
                tracing::debug!(tool_id = %tool_id, "Frontend tool params ready");
                self.try_dispatch_tool_init();
            }
        }
    }

    /// Spawns an async handler and routes its result to the inbox.
    fn spawn_effect<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ChatEvent> + Send + 'static,
    {
        self.pending_tasks += 1;
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(f().await);
        });
    }

    fn try_dispatch_tool_init(&mut self) {
        let Some(tool) = self.state.active_frontend_tool.as_mut() else {
            return;
        };
        if tool.tool_init_dispatched {
            return;
        }
        match frontend_tool::dispatch_tool_init(tool, now_millis()) {
            Ok(message) => self.host.post_to_frontend_tool(&message),
            Err(reason) => tracing::trace!(%reason, "tool_init deferred"),
        }
    }

    // ========================================================================
    // User interaction
    // ========================================================================

    /// Submits `params` for the active frontend tool.
    ///
    /// Accepted submissions clear the tool. Rejections keep it and surface
    /// the server's detail as status text.
    ///
    /// # Errors
    /// Returns an error if no tool is active or the request fails.
    pub async fn submit_active_frontend_tool(&mut self, params: Value) -> Result<SubmitOutcome> {
        let Some(tool) = self.state.active_frontend_tool.as_ref() else {
            bail!("No frontend tool is waiting for input");
        };
        let run_id = tool.run_id.clone();
        let tool_id = tool.tool_id.clone();

        match self.api.submit_frontend_tool(&run_id, &tool_id, &params).await {
            Ok(outcome) if outcome.accepted => {
                if self
                    .state
                    .active_frontend_tool
                    .as_ref()
                    .is_some_and(|t| t.tool_id == tool_id)
                {
                    self.state.active_frontend_tool = None;
                }
                self.state.status_text = None;
                Ok(outcome)
            }
            Ok(outcome) => {
                self.state.status_text = Some(outcome.rejection_text());
                Ok(outcome)
            }
            Err(err) => {
                self.state.status_text = Some(err.to_string());
                Err(err).context("Failed to submit tool input")
            }
        }
    }

    /// Handles a raw message posted by a rendered tool view.
    ///
    /// # Errors
    /// Propagates submission and send failures.
    pub async fn handle_view_message(&mut self, raw: &str) -> Result<()> {
        match ViewMessage::parse(raw) {
            Some(ViewMessage::FrontendSubmit { params }) => {
                self.mark_frontend_tool_interacted();
                self.submit_active_frontend_tool(params).await?;
            }
            Some(ViewMessage::ChatMessage { text }) => {
                self.send_message(&text)?;
            }
            None => tracing::debug!("Ignoring unrecognized view message"),
        }
        Ok(())
    }

    pub fn mark_frontend_tool_interacted(&mut self) {
        if let Some(tool) = self.state.active_frontend_tool.as_mut() {
            tool.user_interacted = true;
        }
    }

    /// Flips a tool entry's expanded flag and returns the new value.
    pub fn toggle_tool_expanded(&mut self, entry_id: &str) -> bool {
        let expanded = self
            .state
            .expanded_tools
            .entry(entry_id.to_string())
            .or_insert(false);
        *expanded = !*expanded;
        *expanded
    }

    pub fn toggle_plan_expanded(&mut self) {
        if let Some(plan) = self.state.plan_state.as_mut() {
            plan.expanded = !plan.expanded;
        }
    }

    pub fn dismiss_action_modal(&mut self) {
        self.state.action_modal = None;
    }
}

impl Drop for ChatRuntime {
    fn drop(&mut self) {
        self.abort_stream();
    }
}

#[cfg(test)]
mod tests {
    use ap_core::AuthCoordinator;
    use ap_core::auth::store::MemoryDeviceTokenStore;
    use ap_core::cache::MemoryChatCache;

    use super::*;
    use crate::host::NoopHost;

    fn runtime() -> ChatRuntime {
        let auth = AuthCoordinator::new(Arc::new(MemoryDeviceTokenStore::new()));
        let api = ApClient::new(auth, "http://127.0.0.1:9");
        ChatRuntime::new(
            api,
            Arc::new(MemoryChatCache::new()),
            Box::new(NoopHost),
            RuntimeOptions {
                agent_key: "default".into(),
                stream_idle_timeout: Duration::from_millis(100),
                reasoning_collapse_delay: Duration::from_millis(50),
            },
        )
    }

    fn stream_event(epoch: u64, event: Value) -> ChatEvent {
        ChatEvent::StreamEvent { epoch, event }
    }

    #[test]
    fn test_switch_chat_resets_state() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        rt.process(stream_event(
            rt.epoch(),
            json!({"type": "content.delta", "contentId": "c1", "delta": "hi"}),
        ));
        rt.toggle_tool_expanded("tool-1");
        assert_eq!(rt.state().timeline.len(), 1);

        rt.switch_chat(Some("b"));
        assert!(rt.state().timeline.is_empty());
        assert!(rt.state().expanded_tools.is_empty());
        assert_eq!(rt.state().chat_id.as_deref(), Some("b"));
        assert!(rt.next_deadline_ms().is_none());
    }

    #[test]
    fn test_stale_epoch_events_are_dropped() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        let old = rt.epoch();
        rt.switch_chat(Some("b"));

        rt.process(stream_event(
            old,
            json!({"type": "content.delta", "contentId": "c1", "delta": "leak"}),
        ));
        assert!(rt.state().timeline.is_empty());
    }

    #[test]
    fn test_idle_tick_clears_streaming() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        rt.process(stream_event(
            rt.epoch(),
            json!({"type": "content.delta", "contentId": "c1", "delta": "x"}),
        ));
        assert!(rt.state().streaming);

        let deadline = rt.next_deadline_ms().unwrap();
        rt.tick(deadline - 1);
        assert!(rt.state().streaming);
        rt.tick(deadline);
        assert!(!rt.state().streaming);
    }

    #[test]
    fn test_reasoning_collapses_after_delay() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        let epoch = rt.epoch();
        rt.process(stream_event(
            epoch,
            json!({"type": "reasoning.delta", "reasoningId": "r", "delta": "think"}),
        ));
        rt.process(stream_event(epoch, json!({"type": "reasoning.end", "reasoningId": "r"})));
        let id = rt.state().timeline[0].id.clone();
        assert!(!rt.state().timeline[0].as_reasoning().unwrap().collapsed);

        let due = rt.collapse_deadlines[&id];
        rt.tick(due);
        assert!(rt.state().timeline[0].as_reasoning().unwrap().collapsed);
    }

    #[test]
    fn test_show_modal_action_opens_modal() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        let epoch = rt.epoch();
        rt.process(stream_event(
            epoch,
            json!({
                "type": "action.end",
                "actionId": "a1",
                "actionName": "show_modal",
                "args": {"title": "Heads up", "content": "Quota low"}
            }),
        ));
        assert_eq!(
            rt.state().action_modal,
            Some(ActionModal {
                title: "Heads up".into(),
                content: "Quota low".into()
            })
        );
        rt.dismiss_action_modal();
        assert!(rt.state().action_modal.is_none());
    }

    #[test]
    fn test_stream_failure_surfaces_status() {
        let mut rt = runtime();
        rt.switch_chat(Some("a"));
        let epoch = rt.epoch();
        rt.process(ChatEvent::StreamFinished {
            epoch,
            outcome: StreamOutcome::Failed("HTTP 502".into()),
        });
        assert_eq!(rt.state().status_text.as_deref(), Some("HTTP 502"));

        rt.process(ChatEvent::StreamFinished {
            epoch,
            outcome: StreamOutcome::Aborted,
        });
        assert_eq!(rt.state().status_text.as_deref(), Some("HTTP 502"));
    }

    #[test]
    fn test_toggle_tool_expanded() {
        let mut rt = runtime();
        assert!(rt.toggle_tool_expanded("tool-1"));
        assert!(!rt.toggle_tool_expanded("tool-1"));
    }

    #[test]
    fn test_send_message_rejects_empty_text() {
        let mut rt = runtime();
        assert!(rt.send_message("   ").is_err());
        assert!(rt.state().timeline.is_empty());
    }
}
