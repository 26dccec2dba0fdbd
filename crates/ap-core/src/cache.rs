//! Local chat cache.
//!
//! Summaries back the offline chat list; a detail blob (image token, raw
//! event array, last sync time) per chat backs offline history replay.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSummary {
    pub chat_id: String,
    pub chat_name: Option<String>,
    pub chat_image_token: Option<String>,
    pub agent_key: Option<String>,
    pub last_run_id: Option<String>,
    pub last_run_content: Option<String>,
    /// Epoch millis of the last activity, if the backend sent one.
    pub updated_at: Option<i64>,
}

impl ChatSummary {
    /// Builds a summary from a backend list item, tolerating loose shapes.
    pub fn from_value(value: &Value) -> Option<Self> {
        let chat_id = value
            .get("chatId")
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)?
            .to_string();
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };
        let last_run_id = match value.get("lastRunId") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let updated_at = ["updatedAt", "lastRunAt", "updateTime"]
            .iter()
            .find_map(|k| value.get(*k))
            .and_then(|v| crate::time::parse_epoch_value(v, crate::time::EVENT_SECONDS_THRESHOLD));
        Some(Self {
            chat_id,
            chat_name: text("chatName"),
            chat_image_token: text("chatImageToken"),
            agent_key: text("agentKey"),
            last_run_id,
            last_run_content: text("lastRunContent"),
            updated_at,
        })
    }
}

/// Denormalized per-chat history blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatDetail {
    pub chat_id: String,
    pub chat_name: Option<String>,
    pub chat_image_token: Option<String>,
    pub events: Vec<Value>,
    pub last_sync_ms: i64,
}

/// Query/command contract used by the chat runtime.
pub trait ChatCache: Send + Sync {
    /// Cached summaries, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be read.
    fn list_cached_chats(&self) -> Result<Vec<ChatSummary>>;

    /// Inserts or replaces summaries by chat id.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be written.
    fn upsert_chat_summaries(&self, summaries: &[ChatSummary]) -> Result<()>;

    /// # Errors
    /// Returns an error if the cache cannot be read.
    fn get_cached_chat_detail(&self, chat_id: &str) -> Result<Option<ChatDetail>>;

    /// # Errors
    /// Returns an error if the cache cannot be written.
    fn upsert_chat_detail(&self, detail: &ChatDetail) -> Result<()>;
}

/// Incremental sync cursor: the greatest `lastRunId` seen.
///
/// Ids compare by length, then lexically, which is numeric order for digit
/// ids.
pub fn max_last_run_id(summaries: &[ChatSummary]) -> Option<String> {
    summaries
        .iter()
        .filter_map(|s| s.last_run_id.as_deref())
        .filter(|id| !id.is_empty())
        .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map(ToString::to_string)
}

fn sort_summaries(list: &mut [ChatSummary]) {
    list.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.chat_id.cmp(&b.chat_id))
    });
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryChatCache {
    summaries: Mutex<BTreeMap<String, ChatSummary>>,
    details: Mutex<HashMap<String, ChatDetail>>,
}

impl MemoryChatCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatCache for MemoryChatCache {
    fn list_cached_chats(&self) -> Result<Vec<ChatSummary>> {
        let guard = self
            .summaries
            .lock()
            .map_err(|e| anyhow::anyhow!("chat cache poisoned: {e}"))?;
        let mut list: Vec<_> = guard.values().cloned().collect();
        sort_summaries(&mut list);
        Ok(list)
    }

    fn upsert_chat_summaries(&self, summaries: &[ChatSummary]) -> Result<()> {
        let mut guard = self
            .summaries
            .lock()
            .map_err(|e| anyhow::anyhow!("chat cache poisoned: {e}"))?;
        for summary in summaries {
            guard.insert(summary.chat_id.clone(), summary.clone());
        }
        Ok(())
    }

    fn get_cached_chat_detail(&self, chat_id: &str) -> Result<Option<ChatDetail>> {
        let guard = self
            .details
            .lock()
            .map_err(|e| anyhow::anyhow!("chat cache poisoned: {e}"))?;
        Ok(guard.get(chat_id).cloned())
    }

    fn upsert_chat_detail(&self, detail: &ChatDetail) -> Result<()> {
        let mut guard = self
            .details
            .lock()
            .map_err(|e| anyhow::anyhow!("chat cache poisoned: {e}"))?;
        guard.insert(detail.chat_id.clone(), detail.clone());
        Ok(())
    }
}

/// JSON files under one directory: `chats.json` plus `chats/<id>.json`.
#[derive(Debug)]
pub struct FileChatCache {
    dir: PathBuf,
    // Serializes read-modify-write of chats.json.
    write_lock: Mutex<()>,
}

impl FileChatCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Cache directory for one backend, so chats never mix across servers.
    pub fn for_backend(base_url: &str) -> Self {
        let slug: String = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        Self::new(crate::config::paths::cache_dir().join(slug))
    }

    fn summaries_path(&self) -> PathBuf {
        self.dir.join("chats.json")
    }

    fn detail_path(&self, chat_id: &str) -> PathBuf {
        let safe: String = chat_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join("chats").join(format!("{safe}.json"))
    }

    fn read_summaries(&self) -> Result<BTreeMap<String, ChatSummary>> {
        let path = self.summaries_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read chat cache from {}", path.display()))?;
        let list: Vec<ChatSummary> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse chat cache from {}", path.display()))?;
        Ok(list.into_iter().map(|s| (s.chat_id.clone(), s)).collect())
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(value).context("Failed to serialize cache")?;
    // Replace atomically.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}

impl ChatCache for FileChatCache {
    fn list_cached_chats(&self) -> Result<Vec<ChatSummary>> {
        let mut list: Vec<_> = self.read_summaries()?.into_values().collect();
        sort_summaries(&mut list);
        Ok(list)
    }

    fn upsert_chat_summaries(&self, summaries: &[ChatSummary]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("chat cache poisoned: {e}"))?;
        let mut all = self.read_summaries()?;
        for summary in summaries {
            all.insert(summary.chat_id.clone(), summary.clone());
        }
        let list: Vec<_> = all.into_values().collect();
        write_json(&self.summaries_path(), &list)
    }

    fn get_cached_chat_detail(&self, chat_id: &str) -> Result<Option<ChatDetail>> {
        let path = self.detail_path(chat_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read chat detail from {}", path.display()))?;
        let detail = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse chat detail from {}", path.display()))?;
        Ok(Some(detail))
    }

    fn upsert_chat_detail(&self, detail: &ChatDetail) -> Result<()> {
        write_json(&self.detail_path(&detail.chat_id), detail)
    }
}
