//! # trichter-live — Real-time sync layer for the Trichter leaderboard
//!
//! Keeps every open viewer in step with the ranked list of runs, using a
//! single server process and no message broker.
//!
//! ## Architecture
//!
//! ```text
//!  device / admin                         viewer (browser or LiveClient)
//!        │ mutation                                  ▲
//!        ▼                                           │ SSE / WebSocket frames
//! ┌────────────┐ publish ┌─────────┐ listener ┌──────┴─────────┐
//! │ RunService │ ──────► │ RunBus  │ ───────► │ StreamEndpoint │ (one per connection)
//! └─────┬──────┘         └─────────┘          └────────────────┘
//!       │ persist first                              │
//!       ▼                                            ▼
//! ┌───────────────┐                         ┌─────────────────┐
//! │ RunRepository │                         │ RunsStore       │ ◄── Reconnector
//! └───────────────┘                         │ (viewer replica)│     (backoff)
//!                                           └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bus`] — Typed publish/subscribe registry with listener isolation
//! - [`protocol`] — Named text frames, SSE codec, WebSocket envelope
//! - [`stream`] — Per-connection fan-out endpoint (SSE body)
//! - [`ws`] — The same fan-out over WebSocket
//! - [`repository`] — Run storage trait and in-memory backend
//! - [`identity`] — Viewer sessions and the device ingest credential
//! - [`service`] — Mutation handlers: validate, authorize, persist, publish
//! - [`replica`] — Viewer-side replica and derived views
//! - [`reconnect`] — Connection state machine and backoff policy
//! - [`transport`] — SSE and WebSocket client transports
//! - [`client`] — Sync agent driving transport, timer and replica
//!
//! ## Limits
//!
//! Fan-out is in-process. Running several server instances partitions the
//! viewers between them; each only sees mutations handled by its own
//! process. Delivery is at most once and there is no replay: a viewer that
//! reconnects re-fetches the snapshot instead.

pub mod bus;
pub mod client;
pub mod identity;
pub mod protocol;
pub mod reconnect;
pub mod replica;
pub mod repository;
pub mod service;
pub mod stream;
pub mod transport;
pub mod ws;

// Re-exports for convenience
pub use bus::{
    BusConfig, BusError, BusEvent, BusStats, EventBus, ListenerError, RunBus, Subscription,
    SubscriptionGuard,
};
pub use client::{ClientConfig, ConnectionStatus, LiveClient};
pub use identity::{IngestCredentials, Role, SessionLookup, StaticSessions, Viewer};
pub use protocol::{decode_event, Frame, FrameDecoder, ProtocolError};
pub use reconnect::{Action, ConnectionState, ReconnectPolicy, Reconnector};
pub use replica::{
    ConnectionQuality, FetchError, HttpRunSource, ReplicaChange, RunSource, RunsStore,
};
pub use repository::{ClaimOutcome, MemoryRunRepository, RepositoryError, RunRepository};
pub use service::{Actor, MutationError, RunService};
pub use stream::{
    ConnectionPhase, EndpointStats, RunEventStream, StreamConfig, StreamEndpoint, StreamError,
    Subscriber,
};
pub use transport::{
    FrameStream, Inbound, SseTransport, Transport, TransportError, WsTransport,
};
pub use ws::WsFanout;
