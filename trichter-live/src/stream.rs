//! Streaming fan-out endpoint: one long-lived connection per viewer.
//!
//! ```text
//!                 open()
//!   ┌──────┐  subscribe ×3  ┌───────────┐  disconnect / stall / shutdown  ┌────────┐
//!   │ Open │ ─────────────► │ Streaming │ ──────────────────────────────► │ Closed │
//!   └──────┘                └───────────┘     guards released once        └────────┘
//! ```
//!
//! Each connection owns a bounded frame buffer. Bus listeners never wait:
//! they `try_send` into the buffer, and a full buffer means the viewer has
//! stalled, which closes that connection alone. Closing drops the three
//! subscription guards immediately, so a closed connection is never written
//! to again.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::task::AtomicWaker;
use futures_util::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use trichter_core::{EventKind, RunEvent};

use crate::bus::{BusError, ListenerError, RunBus, SubscriptionGuard};
use crate::protocol::{self, Frame};

/// Why a connection could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("stream endpoint is shutting down")]
    ShuttingDown,
}

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frames buffered per connection before it counts as stalled
    pub buffer_size: usize,
    /// Idle interval after which a keepalive comment is sent
    pub keepalive: Option<Duration>,
    /// Reconnect hint sent once when the stream starts
    pub retry_hint_ms: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            keepalive: Some(Duration::from_secs(15)),
            retry_hint_ms: Some(1000),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Open,
    Streaming,
    Closed,
}

const PHASE_OPEN: u8 = 0;
const PHASE_STREAMING: u8 = 1;
const PHASE_CLOSED: u8 = 2;

/// Endpoint counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub frames_sent: u64,
    pub stalled: u64,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicEndpointStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    frames_sent: AtomicU64,
    stalled: AtomicU64,
}

/// Shared state of one viewer connection.
pub struct Connection {
    id: u64,
    phase: AtomicU8,
    guards: Mutex<Vec<SubscriptionGuard<RunEvent>>>,
    waker: AtomicWaker,
}

impl Connection {
    fn new(id: u64) -> Self {
        Self {
            id,
            phase: AtomicU8::new(PHASE_OPEN),
            guards: Mutex::new(Vec::with_capacity(EventKind::ALL.len())),
            waker: AtomicWaker::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_OPEN => ConnectionPhase::Open,
            PHASE_STREAMING => ConnectionPhase::Streaming,
            _ => ConnectionPhase::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_CLOSED
    }

    fn start_streaming(&self) -> bool {
        self.phase
            .compare_exchange(PHASE_OPEN, PHASE_STREAMING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Closed` and release the subscriptions. Only the first call
    /// does anything.
    fn close(&self) -> bool {
        if self.phase.swap(PHASE_CLOSED, Ordering::AcqRel) == PHASE_CLOSED {
            return false;
        }
        let guards = std::mem::take(&mut *self.guards.lock());
        drop(guards);
        self.waker.wake();
        log::debug!("Connection {} closed", self.id);
        true
    }
}

struct EndpointInner {
    bus: RunBus,
    config: StreamConfig,
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    stats: Arc<AtomicEndpointStats>,
}

/// Accept point for viewer connections. Cloning shares the endpoint.
#[derive(Clone)]
pub struct StreamEndpoint {
    inner: Arc<EndpointInner>,
}

impl StreamEndpoint {
    pub fn new(bus: RunBus, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                bus,
                config,
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                stats: Arc::new(AtomicEndpointStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &RunBus {
        &self.inner.bus
    }

    /// Accept a connection and subscribe it to every run event kind.
    ///
    /// Fails once [`shutdown`](Self::shutdown) has begun, or when the bus
    /// refuses a subscription; any subscription already taken for this
    /// connection is released before returning.
    pub fn open(&self) -> Result<Subscriber, StreamError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(StreamError::ShuttingDown);
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id));
        let capacity = inner.config.buffer_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let mut guards = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let tx = tx.clone();
            let conn = connection.clone();
            let stats = inner.stats.clone();
            let guard = inner.bus.subscribe_guarded(kind, move |event: &RunEvent| {
                deliver(&conn, &tx, &stats, capacity, event)
            })?;
            guards.push(guard);
        }
        drop(tx);

        *connection.guards.lock() = guards;
        inner.connections.insert(id, connection.clone());
        // A shutdown that raced this open may have missed the registry.
        if inner.shut_down.load(Ordering::Acquire) {
            connection.close();
            inner.connections.remove(&id);
            return Err(StreamError::ShuttingDown);
        }
        if !connection.start_streaming() {
            // A listener closed the connection before the guards were stored.
            let late = std::mem::take(&mut *connection.guards.lock());
            drop(late);
        }
        inner
            .stats
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Connection {id} streaming ({} open)",
            inner.connections.len()
        );

        Ok(Subscriber {
            connection,
            rx,
            endpoint: inner.clone(),
        })
    }

    /// Open a connection wrapped as a server-sent events body.
    pub fn open_stream(&self) -> Result<RunEventStream, StreamError> {
        let subscriber = self.open()?;
        Ok(RunEventStream::new(subscriber, &self.inner.config))
    }

    /// Close every open connection and refuse new ones.
    pub fn shutdown(&self) -> usize {
        self.inner.shut_down.store(true, Ordering::Release);
        let open: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let closed = open.iter().filter(|conn| conn.close()).count();
        log::info!("Stream endpoint shut down, closed {closed} connections");
        closed
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    pub fn stats(&self) -> EndpointStats {
        let stats = &self.inner.stats;
        EndpointStats {
            connections_opened: stats.connections_opened.load(Ordering::Relaxed),
            connections_closed: stats.connections_closed.load(Ordering::Relaxed),
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            stalled: stats.stalled.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
        }
    }
}

fn deliver(
    conn: &Connection,
    tx: &mpsc::Sender<Frame>,
    stats: &AtomicEndpointStats,
    capacity: usize,
    event: &RunEvent,
) -> Result<(), ListenerError> {
    if conn.is_closed() {
        return Ok(());
    }
    let frame = Frame::from_event(event).map_err(|e| ListenerError::Encode(e.to_string()))?;
    match tx.try_send(frame) {
        Ok(()) => {
            stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(TrySendError::Closed(_)) => {
            conn.close();
            Ok(())
        }
        Err(TrySendError::Full(_)) => {
            stats.stalled.fetch_add(1, Ordering::Relaxed);
            log::warn!("Connection {} stalled, closing", conn.id);
            conn.close();
            Err(ListenerError::Stalled { capacity })
        }
    }
}

/// Receiving half of one viewer connection.
///
/// Dropping it closes the connection and releases its subscriptions.
pub struct Subscriber {
    connection: Arc<Connection>,
    rx: mpsc::Receiver<Frame>,
    endpoint: Arc<EndpointInner>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.connection.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Next frame, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        futures_util::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        if self.connection.is_closed() {
            return Poll::Ready(None);
        }
        self.connection.waker.register(cx.waker());
        if self.connection.is_closed() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }

    pub fn close(&self) -> bool {
        self.connection.close()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.connection.close();
        if self.endpoint.connections.remove(&self.connection.id).is_some() {
            self.endpoint
                .stats
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Server-sent events body for one connection.
///
/// Yields the retry hint first, then one encoded frame per event, with a
/// keepalive comment whenever the connection has been idle for the
/// configured interval. Ends when the connection closes.
pub struct RunEventStream {
    subscriber: Subscriber,
    keepalive: Option<Interval>,
    prelude: Option<Bytes>,
}

impl RunEventStream {
    pub fn new(subscriber: Subscriber, config: &StreamConfig) -> Self {
        let keepalive = config.keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            subscriber,
            keepalive,
            prelude: config.retry_hint_ms.map(protocol::retry_hint),
        }
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }
}

impl Stream for RunEventStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(prelude) = this.prelude.take() {
            return Poll::Ready(Some(Ok(prelude)));
        }

        match this.subscriber.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if let Some(keepalive) = this.keepalive.as_mut() {
                    keepalive.reset();
                }
                return Poll::Ready(Some(Ok(frame.to_bytes())));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if let Some(keepalive) = this.keepalive.as_mut() {
            if keepalive.poll_tick(cx).is_ready() {
                return Poll::Ready(Some(Ok(protocol::keepalive())));
            }
        }
        Poll::Pending
    }
}
