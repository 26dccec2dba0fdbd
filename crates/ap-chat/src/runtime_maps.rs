//! Identity side table for the reducer.
//!
//! Backend correlation ids (contentId, toolId, ...) map to synthesized
//! timeline entry ids. This index lives for the whole open chat and is reset
//! only on chat switch, so it is kept out of [`ChatState`](crate::ChatState).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// Which id map a correlation id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Content,
    Tool,
    Action,
    Reasoning,
}

impl Family {
    fn prefix(self) -> &'static str {
        match self {
            Family::Content => "msg",
            Family::Tool => "tool",
            Family::Action => "action",
            Family::Reasoning => "reasoning",
        }
    }
}

/// Highest `chunkIndex` accepted into an args buffer.
pub const MAX_CHUNK_INDEX: u64 = 4_096;

/// Argument text assembled from deltas, optionally indexed.
#[derive(Debug, Clone, Default)]
pub struct ArgsBuffer {
    plain: String,
    chunks: BTreeMap<u64, String>,
    /// Largest rejected index above [`MAX_CHUNK_INDEX`].
    overflow: Option<u64>,
}

impl ArgsBuffer {
    /// Appends a delta. Indexed deltas are placed by index; a repeated index
    /// replaces the earlier chunk. Indexes above [`MAX_CHUNK_INDEX`] are
    /// dropped and remembered as an overflow.
    pub fn push(&mut self, delta: &str, chunk_index: Option<u64>) {
        match chunk_index {
            Some(index) if index > MAX_CHUNK_INDEX => {
                tracing::warn!(index, "Dropping out-of-range tool argument chunk");
                self.overflow = self.overflow.max(Some(index));
            }
            Some(index) => {
                self.chunks.insert(index, delta.to_string());
            }
            None => self.plain.push_str(delta),
        }
    }

    pub fn replace(&mut self, text: String) {
        self.chunks.clear();
        self.overflow = None;
        self.plain = text;
    }

    pub fn text(&self) -> String {
        if self.chunks.is_empty() {
            return self.plain.clone();
        }
        let mut out: String = self.chunks.values().map(String::as_str).collect();
        out.push_str(&self.plain);
        out
    }

    /// Indexes below the highest accepted index that have not arrived.
    pub fn missing_indexes(&self) -> Vec<u64> {
        let Some(&max) = self.chunks.keys().next_back() else {
            return Vec::new();
        };
        (0..max).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    pub fn overflow(&self) -> Option<u64> {
        self.overflow
    }

    /// True while chunks are missing or an index was out of range.
    pub fn has_gap(&self) -> bool {
        self.overflow.is_some() || !self.missing_indexes().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.chunks.is_empty() && self.overflow.is_none()
    }

    /// Parses the assembled text as a JSON object.
    ///
    /// An empty buffer parses as `{}`.
    pub fn parse(&self) -> Result<Value, String> {
        let text = self.text();
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err("Tool arguments are not a JSON object".to_string()),
            Err(e) => Err(format!("Tool arguments are not valid JSON: {e}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolScratch {
    pub args: ArgsBuffer,
}

#[derive(Debug, Clone, Default)]
pub struct ActionScratch {
    pub args: ArgsBuffer,
    /// Set once the `execute_action` effect has been emitted.
    pub executed: bool,
}

#[derive(Debug, Default)]
pub struct RuntimeMaps {
    seq: u64,
    content_ids: HashMap<String, String>,
    tool_ids: HashMap<String, String>,
    action_ids: HashMap<String, String>,
    reasoning_ids: HashMap<String, String>,
    pub tools: HashMap<String, ToolScratch>,
    pub actions: HashMap<String, ActionScratch>,
    /// Current run, recorded by `run.start`.
    pub run_id: Option<String>,
}

impl RuntimeMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn map_mut(&mut self, family: Family) -> &mut HashMap<String, String> {
        match family {
            Family::Content => &mut self.content_ids,
            Family::Tool => &mut self.tool_ids,
            Family::Action => &mut self.action_ids,
            Family::Reasoning => &mut self.reasoning_ids,
        }
    }

    /// Entry id for a correlation id, synthesizing one on first sight.
    pub fn entry_id(&mut self, family: Family, correlation_id: &str) -> String {
        if let Some(existing) = self.map_mut(family).get(correlation_id) {
            return existing.clone();
        }
        let id = self.next_id(family.prefix());
        self.map_mut(family)
            .insert(correlation_id.to_string(), id.clone());
        id
    }

    pub fn lookup(&self, family: Family, correlation_id: &str) -> Option<&str> {
        let map = match family {
            Family::Content => &self.content_ids,
            Family::Tool => &self.tool_ids,
            Family::Action => &self.action_ids,
            Family::Reasoning => &self.reasoning_ids,
        };
        map.get(correlation_id).map(String::as_str)
    }
}
