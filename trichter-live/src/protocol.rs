//! Wire protocol: named text frames carrying JSON payloads.
//!
//! Server-sent events encoding (one frame per bus event):
//! ```text
//! event: run-created
//! data: {"id":"…","data":{…},"createdAt":"…","user":null}
//! <blank line>
//! ```
//!
//! Comment lines (`: keepalive`) carry no event and are skipped by
//! readers. A `retry: <ms>` line tells the reader how long to wait before
//! reconnecting.
//!
//! Over WebSocket the same frame is one text message:
//! `{"event":"run-deleted","data":{"id":"…"}}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trichter_core::{EventKind, RunDeleted, RunEvent, RunWithOwner};

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown event name {0:?}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
    #[error("{event} payload has no id")]
    MissingId { event: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One named frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Event name; `None` means the default `message` event
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Reconnect hint in milliseconds
    pub retry: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Serialize a bus event into its wire frame.
    pub fn from_event(event: &RunEvent) -> Result<Self, ProtocolError> {
        let data = event
            .payload_json()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(event.kind().wire_name(), data))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    /// Server-sent events text encoding, terminated by a blank line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.trim_end_matches('\r'));
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }

    /// WebSocket text message: `{"event": …, "data": …}`.
    ///
    /// JSON payloads are embedded as values; anything else as a string.
    pub fn to_ws_text(&self) -> Result<String, ProtocolError> {
        let data = serde_json::from_str(&self.data)
            .unwrap_or_else(|_| serde_json::Value::String(self.data.clone()));
        let envelope = WsEnvelope {
            event: self.event_name().to_string(),
            data,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_ws_text(text: &str) -> Result<Self, ProtocolError> {
        let envelope: WsEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
                event: "websocket message".into(),
                reason: e.to_string(),
            })?;
        let data = match envelope.data {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Self::new(envelope.event, data))
    }
}

#[derive(Serialize, Deserialize)]
struct WsEnvelope {
    event: String,
    data: serde_json::Value,
}

/// Comment frame that keeps idle connections open through proxies.
pub fn keepalive() -> Bytes {
    Bytes::from_static(b": keepalive\n\n")
}

/// Frame carrying only a reconnect hint; readers dispatch no event for it.
pub fn retry_hint(retry_ms: u64) -> Bytes {
    Bytes::from(format!("retry: {retry_ms}\n\n"))
}

/// Decode a received frame into a run event.
///
/// Unknown names, invalid JSON and payloads without a usable `id` are
/// rejected; callers log and drop them.
pub fn decode_event(frame: &Frame) -> Result<RunEvent, ProtocolError> {
    let name = frame.event_name();
    let kind =
        EventKind::from_wire_name(name).ok_or_else(|| ProtocolError::UnknownEvent(name.into()))?;

    let value: serde_json::Value =
        serde_json::from_str(&frame.data).map_err(|e| ProtocolError::Malformed {
            event: name.into(),
            reason: e.to_string(),
        })?;

    let has_id = value
        .get("id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        return Err(ProtocolError::MissingId { event: name.into() });
    }

    let malformed = |e: serde_json::Error| ProtocolError::Malformed {
        event: name.into(),
        reason: e.to_string(),
    };
    match kind {
        EventKind::RunCreated => Ok(RunEvent::Created(
            serde_json::from_value::<RunWithOwner>(value).map_err(malformed)?,
        )),
        EventKind::RunUpdated => Ok(RunEvent::Updated(
            serde_json::from_value::<RunWithOwner>(value).map_err(malformed)?,
        )),
        EventKind::RunDeleted => Ok(RunEvent::Deleted(
            serde_json::from_value::<RunDeleted>(value).map_err(malformed)?,
        )),
    }
}

/// Incremental server-sent events parser.
///
/// Accepts arbitrary chunks (a frame, a UTF-8 sequence or a CRLF pair may
/// be split across them) and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent `retry:` hint seen on the stream, in milliseconds.
    pub fn retry_hint(&self) -> Option<u64> {
        self.retry
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Feed one chunk, returning every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            other => log::trace!("Ignoring unknown stream field {other:?}"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame {
            event,
            data,
            id: self.last_id.clone(),
            retry: None,
        })
    }
}
