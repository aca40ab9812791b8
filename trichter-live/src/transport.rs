//! Client transports: how a viewer opens its event stream.
//!
//! A transport only opens connections; retry and backoff live in the
//! reconnection controller. An open session is a stream of frames that
//! ends (or yields an error) when the connection drops. Keepalive traffic
//! surfaces as [`Inbound::Heartbeat`] so the client can tell a quiet
//! connection from a dead one.

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, FrameDecoder};

/// Transport failures. All of them are handled by the backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server answered {0}")]
    Status(u16),
    #[error("stream error: {0}")]
    Stream(String),
}

/// One item received on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// Traffic that carried no frame (SSE comment, WebSocket ping/pong)
    Heartbeat,
}

/// Inbound items of one open session.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

/// Opens event stream sessions.
pub trait Transport: Send + Sync {
    fn open(&self) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Server-sent events over HTTP.
///
/// Sends `POST` to the stream URL (as the browser client does) and decodes
/// the chunked body incrementally.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for SseTransport {
    fn open(&self) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        let url = self.url.clone();

        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            log::debug!("Event stream open at {url}");

            let mut decoder = FrameDecoder::new();
            let frames = response
                .bytes_stream()
                .map(move |chunk| match chunk {
                    Ok(bytes) => {
                        let frames = decoder.push(&bytes);
                        if frames.is_empty() {
                            vec![Ok(Inbound::Heartbeat)]
                        } else {
                            frames.into_iter().map(|f| Ok(Inbound::Frame(f))).collect()
                        }
                    }
                    Err(e) => vec![Err(TransportError::Stream(e.to_string()))],
                })
                .flat_map(stream::iter);
            Ok(Box::pin(frames) as FrameStream)
        })
    }
}

/// JSON text messages over WebSocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Transport for WsTransport {
    fn open(&self) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            log::debug!("WebSocket stream open at {url}");

            let frames = ws_stream.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => match Frame::from_ws_text(text.as_str()) {
                        Ok(frame) => Some(Ok(Inbound::Frame(frame))),
                        Err(e) => {
                            log::warn!("Dropping WebSocket message: {e}");
                            None
                        }
                    },
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Ok(Inbound::Heartbeat)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
                }
            });
            Ok(Box::pin(frames) as FrameStream)
        })
    }
}
