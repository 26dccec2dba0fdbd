//! CLI command handlers.

pub mod ask;
pub mod auth;
pub mod chats;
pub mod config;

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use ap_chat::events::EntryState;
use ap_chat::state::{ChatState, EntryKind, Role, TimelineEntry};
use ap_core::auth::FileDeviceTokenStore;
use ap_core::cache::FileChatCache;
use ap_core::config::Config;
use ap_core::{ApClient, AuthCoordinator, Session};

/// Coordinator and client for the configured backend.
pub struct Backend {
    pub base_url: String,
    pub auth: AuthCoordinator,
    pub api: ApClient,
}

impl Backend {
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = config.require_base_url()?;
        let store = Arc::new(FileDeviceTokenStore::default_location());
        let auth = AuthCoordinator::new(store);
        let api = ApClient::new(auth.clone(), base_url.clone())
            .with_timeout(config.request_timeout())
            .with_prefresh(config.auth.fresh_token_options());
        Ok(Self {
            base_url,
            auth,
            api,
        })
    }

    /// Restores the session from the stored device token.
    pub async fn restore(&self) -> Option<Session> {
        self.auth.restore_session(&self.base_url).await
    }

    /// Like [`Backend::restore`], but a missing session is an error.
    pub async fn require_session(&self) -> Result<Session> {
        self.restore()
            .await
            .context("Not logged in. Run `ap login` first")
    }

    pub fn cache(&self) -> Arc<FileChatCache> {
        Arc::new(FileChatCache::for_backend(&self.base_url))
    }
}

/// Renders the timeline as plain text, one block per entry.
pub fn format_transcript(state: &ChatState) -> String {
    let mut out = format_entries(state, &state.timeline);
    if let Some(plan) = &state.plan_state
        && let Some(progress) = state.progress()
        && progress.total > 0
    {
        let _ = writeln!(out, "[plan {}/{}]", progress.current, progress.total);
        if plan.expanded {
            for task in &plan.tasks {
                let _ = writeln!(out, "  [{}] {}", state_label(task.status), task.description);
            }
        }
    }
    out
}

/// Renders `entries`; tools expanded in `state` also show their arguments
/// and result.
pub fn format_entries(state: &ChatState, entries: &[TimelineEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        match &entry.kind {
            EntryKind::Message(message) => match message.role {
                Role::User => {
                    let _ = writeln!(out, "> {}", message.text);
                }
                Role::Assistant => {
                    let _ = writeln!(out, "{}", message.text);
                }
                Role::System => {
                    let _ = writeln!(out, "[{}]", message.text);
                }
            },
            EntryKind::Tool(tool) => {
                let _ = writeln!(out, "[tool] {} ({})", tool.label, state_label(tool.state));
                if let Some(error) = &tool.error {
                    let _ = writeln!(out, "  error: {error}");
                }
                if state.expanded_tools.get(&entry.id).copied().unwrap_or(false) {
                    if !tool.args_text.is_empty() {
                        let _ = writeln!(out, "  args: {}", tool.args_text);
                    }
                    if !tool.result_text.is_empty() {
                        let _ = writeln!(out, "  result: {}", tool.result_text);
                    }
                }
            }
            EntryKind::Action(action) => {
                let _ = writeln!(out, "[action] {} ({})", action.label, state_label(action.state));
            }
            EntryKind::Reasoning(reasoning) => {
                if reasoning.collapsed {
                    let _ = writeln!(out, "[reasoning]");
                } else {
                    let _ = writeln!(out, "[reasoning] {}", reasoning.text);
                }
            }
        }
    }
    out
}

fn state_label(state: EntryState) -> &'static str {
    match state {
        EntryState::Init => "pending",
        EntryState::Running => "running",
        EntryState::Done => "done",
        EntryState::Failed => "failed",
    }
}
