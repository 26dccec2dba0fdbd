//! Server-Sent-Events framing for the query stream.
//!
//! Frames are blank-line-delimited blocks. Each block's `data:` lines are
//! joined with `\n` and parsed as one JSON object. A corrupt frame is
//! reported through a callback and never stops the frames after it.

use std::{fmt, mem};

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Terminal sentinel some backends send; ignored silently.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Body preview length carried by [`StreamError::HttpStatus`].
pub const ERROR_PREVIEW_CHARS: usize = 200;

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MalformedReason {
    MissingDataLine,
    JsonPayloadNotObject,
    JsonParseError,
}

impl MalformedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MalformedReason::MissingDataLine => "missing_data_line",
            MalformedReason::JsonPayloadNotObject => "json_payload_not_object",
            MalformedReason::JsonParseError => "json_parse_error",
        }
    }
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`split_sse_frames`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseSplit {
    /// Complete blocks, without their terminating blank line.
    pub frames: Vec<String>,
    /// Trailing text not yet terminated by a blank line.
    pub incomplete: String,
}

/// Splits raw stream text into complete frames plus the unterminated tail.
pub fn split_sse_frames(raw: &str) -> SseSplit {
    let normalized = raw.replace("\r\n", "\n");
    let mut frames = Vec::new();
    let mut rest = normalized.as_str();
    while let Some(idx) = rest.find("\n\n") {
        frames.push(rest[..idx].to_string());
        rest = &rest[idx + 2..];
    }
    SseSplit {
        frames,
        incomplete: rest.to_string(),
    }
}

/// Parses one frame.
///
/// Whitespace-only and comment-only blocks (keepalives) are skipped without
/// a report.
pub fn parse_sse_block<E, M>(block: &str, on_event: &mut E, on_malformed: &mut M)
where
    E: FnMut(Value),
    M: FnMut(&str, MalformedReason),
{
    let mut data_lines = Vec::new();
    let mut has_content = false;
    for line in block.lines() {
        if line.trim().is_empty() || line.starts_with(':') {
            continue;
        }
        has_content = true;
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if !has_content {
        return;
    }

    let mut report = |reason: MalformedReason| {
        tracing::debug!(%reason, "dropping malformed SSE frame");
        on_malformed(block, reason);
    };

    if data_lines.is_empty() {
        report(MalformedReason::MissingDataLine);
        return;
    }
    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value @ Value::Object(_)) => on_event(value),
        Ok(_) => report(MalformedReason::JsonPayloadNotObject),
        Err(_) => report(MalformedReason::JsonParseError),
    }
}

/// Incremental decoder for a byte stream.
///
/// Keeps only the unterminated tail between calls, so each `feed` frames
/// just the newly arrived text.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Bytes of a UTF-8 sequence split across chunks.
    partial: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns the frames they completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial.len(),
        };
        let text = String::from_utf8_lossy(&self.partial[..valid]).into_owned();
        self.partial.drain(..valid);

        self.buffer.push_str(&text);
        let split = split_sse_frames(&self.buffer);
        self.buffer = split.incomplete;
        split.frames
    }

    /// Returns the trailing unterminated block, if any.
    pub fn finish(&mut self) -> Option<String> {
        if !self.partial.is_empty() {
            let tail = String::from_utf8_lossy(&self.partial).into_owned();
            self.buffer.push_str(&tail);
            self.partial.clear();
        }
        let rest = mem::take(&mut self.buffer);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

/// Why a stream stopped before completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Cancelled by us. Not a user-facing failure.
    Aborted,
    /// Connection dropped or body read failed.
    Transport(String),
    /// Non-2xx status, with a truncated body preview.
    HttpStatus { status: u16, preview: String },
}

impl StreamError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, StreamError::Aborted)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Aborted => write!(f, "Stream aborted"),
            StreamError::Transport(msg) => write!(f, "Stream failed: {msg}"),
            StreamError::HttpStatus { status, preview } if preview.is_empty() => {
                write!(f, "HTTP {status}")
            }
            StreamError::HttpStatus { status, preview } => write!(f, "HTTP {status}: {preview}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Truncates a body to [`ERROR_PREVIEW_CHARS`] characters.
pub fn body_preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(ERROR_PREVIEW_CHARS).collect();
    out.push('…');
    out
}

/// Reads a streaming response to completion, delivering events in order.
///
/// Returns the number of events delivered. Cancelling `cancel` stops
/// delivery immediately and yields [`StreamError::Aborted`].
///
/// # Errors
/// Returns [`StreamError`] on cancellation, transport failure, or a non-2xx
/// status.
pub async fn read_event_stream<E, M>(
    response: reqwest::Response,
    cancel: &CancellationToken,
    mut on_event: E,
    mut on_malformed: M,
) -> Result<usize, StreamError>
where
    E: FnMut(Value),
    M: FnMut(&str, MalformedReason),
{
    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            () = cancel.cancelled() => return Err(StreamError::Aborted),
            body = response.text() => body.unwrap_or_default(),
        };
        return Err(StreamError::HttpStatus {
            status: status.as_u16(),
            preview: body_preview(&body),
        });
    }

    let mut delivered = 0usize;
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();
    let mut deliver = |frame: &str, delivered: &mut usize| {
        parse_sse_block(
            frame,
            &mut |event| {
                *delivered += 1;
                on_event(event);
            },
            &mut on_malformed,
        );
    };

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Aborted),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for frame in decoder.feed(&bytes) {
                    if cancel.is_cancelled() {
                        return Err(StreamError::Aborted);
                    }
                    deliver(&frame, &mut delivered);
                }
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return Err(StreamError::Aborted);
                }
                return Err(StreamError::Transport(e.to_string()));
            }
            None => break,
        }
    }

    if let Some(rest) = decoder.finish()
        && !cancel.is_cancelled()
    {
        deliver(&rest, &mut delivered);
    }
    Ok(delivered)
}
