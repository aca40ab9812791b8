//! WebSocket flavour of the fan-out endpoint.
//!
//! ```text
//! Viewer A ──┐                          ┌── Subscriber (conn 1) ◄──┐
//!             ├── WsFanout (TcpListener) ┤                          ├── RunBus
//! Viewer B ──┘                          └── Subscriber (conn 2) ◄──┘
//! ```
//!
//! Every accepted socket gets its own [`Subscriber`](crate::stream::Subscriber)
//! and receives each run event as one JSON text message. When the endpoint
//! has a keepalive interval, an idle socket is pinged at that interval so
//! viewers can detect a dead connection. Viewers are not expected to send
//! anything but pings and the closing handshake.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::stream::StreamEndpoint;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves run events to WebSocket viewers.
#[derive(Clone)]
pub struct WsFanout {
    endpoint: StreamEndpoint,
    bind_addr: String,
}

impl WsFanout {
    pub fn new(endpoint: StreamEndpoint, bind_addr: impl Into<String>) -> Self {
        Self {
            endpoint,
            bind_addr: bind_addr.into(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!("WebSocket fan-out listening on {}", self.bind_addr);
        self.serve(listener).await
    }

    /// Serve viewers accepted on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let endpoint = self.endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, endpoint).await {
                    log::warn!("WebSocket connection from {addr} failed: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        endpoint: StreamEndpoint,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut subscriber = match endpoint.open() {
            Ok(subscriber) => subscriber,
            Err(e) => {
                log::warn!("Refusing WebSocket viewer {addr}: {e}");
                let close = CloseFrame {
                    code: CloseCode::Again,
                    reason: e.to_string().into(),
                };
                ws_sender.send(Message::Close(Some(close))).await?;
                return Ok(());
            }
        };
        log::debug!("WebSocket viewer {addr} streaming as connection {}", subscriber.id());

        let mut keepalive = endpoint.config().keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("WebSocket viewer {addr} disconnected");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(other)) => {
                            log::trace!("Ignoring {} byte message from viewer {addr}", other.len());
                        }
                    }
                }

                _ = async {
                    match keepalive.as_mut() {
                        Some(interval) => interval.tick().await,
                        None => std::future::pending().await,
                    }
                }, if keepalive.is_some() => {
                    ws_sender.send(Message::Ping(Bytes::new())).await?;
                }

                frame = subscriber.recv() => {
                    match frame {
                        Some(frame) => {
                            let text = frame.to_ws_text()?;
                            ws_sender.send(Message::Text(text.into())).await?;
                            if let Some(interval) = keepalive.as_mut() {
                                interval.reset();
                            }
                        }
                        None => {
                            // Closed by shutdown or a stall.
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
