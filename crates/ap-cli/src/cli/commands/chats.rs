//! Chat list and transcript commands.

use anyhow::{Context, Result};
use ap_chat::runtime::handlers;
use ap_chat::{ChatRuntime, NoopHost, RuntimeOptions};
use ap_core::cache::{ChatCache, ChatSummary};
use ap_core::config::Config;

use super::{Backend, format_transcript};

const PREVIEW_CHARS: usize = 60;

pub async fn list(config: &Config, offline: bool) -> Result<()> {
    let backend = Backend::new(config)?;
    let cache = backend.cache();

    let chats = if offline {
        cache.list_cached_chats().context("read chat cache")?
    } else {
        backend.require_session().await?;
        handlers::sync_chat_list(&backend.api, cache.as_ref()).await?
    };

    if chats.is_empty() {
        println!("No chats found.");
    } else {
        for chat in &chats {
            println!("{}", format_summary(chat));
        }
    }
    Ok(())
}

fn format_summary(chat: &ChatSummary) -> String {
    let name = chat.chat_name.as_deref().unwrap_or("(untitled)");
    let preview: String = chat
        .last_run_content
        .as_deref()
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(PREVIEW_CHARS)
        .collect();
    if preview.is_empty() {
        format!("{}  {}", chat.chat_id, name)
    } else {
        format!("{}  {}  {}", chat.chat_id, name, preview)
    }
}

pub async fn show(config: &Config, id: &str, expand: bool) -> Result<()> {
    let backend = Backend::new(config)?;
    // Without a session the fetch fails and history comes from the cache.
    backend.restore().await;

    let mut runtime = ChatRuntime::new(
        backend.api.clone(),
        backend.cache(),
        Box::new(NoopHost),
        RuntimeOptions::from_config(config),
    );
    runtime
        .open_chat(id)
        .await
        .with_context(|| format!("show chat '{id}'"))?;

    if expand {
        runtime.toggle_plan_expanded();
        let tool_ids: Vec<String> = runtime
            .state()
            .timeline
            .iter()
            .filter(|e| e.as_tool().is_some())
            .map(|e| e.id.clone())
            .collect();
        for tool_id in &tool_ids {
            runtime.toggle_tool_expanded(tool_id);
        }
    }

    if let Some(status) = &runtime.state().status_text {
        eprintln!("{status}");
    }
    print!("{}", format_transcript(runtime.state()));
    Ok(())
}
