//! Viewer-side replica of the leaderboard.
//!
//! [`RunsStore`] holds every run keyed by id, so upserts and removals are
//! O(1) and an update never moves a record. Storage order carries no
//! meaning once records have been removed; the ranked views are computed
//! on each read from that one source of truth.
//! Observers subscribe to [`ReplicaChange`] notifications and re-read the
//! views they care about.
//!
//! The store is only mutated by the sync agent: the initial snapshot,
//! forced re-fetches, and inbound frames. Frames that arrive while a
//! snapshot is in flight are applied immediately and also buffered, then
//! replayed over the snapshot once it lands. Each load carries a
//! generation number; a load that was overtaken by a newer one or by
//! [`RunsStore::initialize`] discards its result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use trichter_core::{RunEvent, RunWithOwner};

use crate::protocol::{decode_event, Frame};
use crate::repository::{MemoryRunRepository, RunRepository};

/// Snapshot fetch failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server answered {0}")]
    Status(u16),
    #[error("invalid snapshot: {0}")]
    Decode(String),
    #[error("source unavailable: {0}")]
    Source(String),
}

/// Where the replica's snapshot comes from.
pub trait RunSource: Send + Sync {
    /// All runs, best rate first.
    fn list_ranked(&self) -> BoxFuture<'_, Result<Vec<RunWithOwner>, FetchError>>;
}

impl RunSource for MemoryRunRepository {
    fn list_ranked(&self) -> BoxFuture<'_, Result<Vec<RunWithOwner>, FetchError>> {
        Box::pin(async move {
            RunRepository::list_ranked(self)
                .await
                .map_err(|e| FetchError::Source(e.to_string()))
        })
    }
}

/// Snapshot over HTTP (`GET {base}/api/v1/runs`).
#[derive(Debug, Clone)]
pub struct HttpRunSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRunSource {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/runs", base_url.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RunSource for HttpRunSource {
    fn list_ranked(&self) -> BoxFuture<'_, Result<Vec<RunWithOwner>, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| FetchError::Request(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::Request(e.to_string()))?;
            parse_snapshot(&body)
        })
    }
}

fn parse_snapshot(body: &[u8]) -> Result<Vec<RunWithOwner>, FetchError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Snapshot {
        Plain(Vec<RunWithOwner>),
        Wrapped { data: Vec<RunWithOwner> },
    }
    match serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))? {
        Snapshot::Plain(runs) | Snapshot::Wrapped { data: runs } => Ok(runs),
    }
}

/// What changed in the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaChange {
    /// Contents replaced wholesale
    Reset,
    Upserted { id: String, inserted: bool },
    Removed { id: String },
}

/// Freshness of the event stream, derived from the last applied event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Unknown,
    Good,
    Poor,
}

#[derive(Default)]
struct ReplicaState {
    runs: IndexMap<String, RunWithOwner>,
    is_loading: bool,
    error: Option<FetchError>,
    last_event_at: Option<Instant>,
    generation: u64,
    /// Mutations seen since the in-flight load started
    pending: Option<Vec<RunEvent>>,
}

impl ReplicaState {
    fn replace(&mut self, runs: Vec<RunWithOwner>) {
        self.runs = runs.into_iter().map(|r| (r.id.clone(), r)).collect();
    }

    fn apply(&mut self, event: RunEvent) -> Option<ReplicaChange> {
        match event {
            RunEvent::Created(run) | RunEvent::Updated(run) => {
                let id = run.id.clone();
                let inserted = match self.runs.get_mut(&id) {
                    Some(existing) => {
                        *existing = run;
                        false
                    }
                    None => {
                        self.runs.insert(id.clone(), run);
                        true
                    }
                };
                Some(ReplicaChange::Upserted { id, inserted })
            }
            RunEvent::Deleted(deleted) => self
                .runs
                .swap_remove(&deleted.id)
                .map(|_| ReplicaChange::Removed { id: deleted.id }),
        }
    }
}

/// Local replica of the ranked dataset plus its derived views.
#[derive(Clone)]
pub struct RunsStore {
    state: Arc<RwLock<ReplicaState>>,
    source: Arc<dyn RunSource>,
    changes: broadcast::Sender<ReplicaChange>,
}

impl RunsStore {
    pub fn new(source: Arc<dyn RunSource>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(ReplicaState::default())),
            source,
            changes,
        }
    }

    /// Change notifications. Slow observers may see `Lagged` and should
    /// simply re-read the views.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: ReplicaChange) {
        let _ = self.changes.send(change);
    }

    /// Replace the replica with `runs`. A load still in flight is
    /// superseded.
    pub fn initialize(&self, runs: Vec<RunWithOwner>) {
        {
            let mut state = self.state.write();
            state.replace(runs);
            state.error = None;
            state.generation += 1;
            state.pending = None;
            state.is_loading = false;
        }
        self.notify(ReplicaChange::Reset);
    }

    /// Use a snapshot the caller already has, or fetch one.
    pub async fn initialize_or_load(&self, initial: Option<Vec<RunWithOwner>>) -> Result<(), FetchError> {
        match initial {
            Some(runs) => {
                self.initialize(runs);
                Ok(())
            }
            None => self.load_if_needed(false).await,
        }
    }

    /// Fetch a fresh snapshot unless the replica already has data.
    ///
    /// With `force` the snapshot is always re-fetched. On failure the
    /// current contents are kept and the error is recorded. Mutations
    /// applied during the fetch survive the snapshot.
    pub async fn load_if_needed(&self, force: bool) -> Result<(), FetchError> {
        let generation = {
            let mut state = self.state.write();
            if !force && !state.runs.is_empty() {
                return Ok(());
            }
            state.generation += 1;
            state.is_loading = true;
            state.pending = Some(Vec::new());
            state.generation
        };

        let result = self.source.list_ranked().await;

        let mut state = self.state.write();
        if state.generation != generation {
            log::debug!("Discarding snapshot from superseded load {generation}");
            return result.map(|_| ());
        }
        state.is_loading = false;
        let buffered = state.pending.take().unwrap_or_default();
        match result {
            Ok(runs) => {
                log::debug!(
                    "Loaded {} runs, replaying {} buffered events",
                    runs.len(),
                    buffered.len()
                );
                state.replace(runs);
                for event in buffered {
                    state.apply(event);
                }
                state.error = None;
                drop(state);
                self.notify(ReplicaChange::Reset);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to load runs: {e}");
                state.error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Apply one mutation, buffering it for replay if a load is in flight.
    fn mutate(&self, event: RunEvent, received: bool) -> Option<ReplicaChange> {
        let change = {
            let mut state = self.state.write();
            if received {
                state.last_event_at = Some(Instant::now());
            }
            if let Some(pending) = state.pending.as_mut() {
                pending.push(event.clone());
            }
            state.apply(event)
        };
        if let Some(change) = &change {
            self.notify(change.clone());
        }
        change
    }

    /// Replace in place, or add when the id is new.
    ///
    /// Returns whether the record was inserted.
    pub fn upsert(&self, run: RunWithOwner) -> bool {
        matches!(
            self.mutate(RunEvent::Updated(run), false),
            Some(ReplicaChange::Upserted { inserted: true, .. })
        )
    }

    /// Remove a record. Absent ids are ignored.
    pub fn remove(&self, id: &str) -> bool {
        self.mutate(RunEvent::deleted(id), false).is_some()
    }

    pub fn apply_event(&self, event: RunEvent) {
        self.mutate(event, true);
    }

    /// Decode and apply one inbound frame. Bad frames are logged and
    /// dropped; returns whether the frame was applied.
    pub fn apply_frame(&self, frame: &Frame) -> bool {
        match decode_event(frame) {
            Ok(event) => {
                self.apply_event(event);
                true
            }
            Err(e) => {
                log::warn!("Dropping {} frame: {e}", frame.event_name());
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<RunWithOwner> {
        self.state.read().runs.get(id).cloned()
    }

    /// Records in storage order: arrival order until the first removal,
    /// unspecified after.
    pub fn runs(&self) -> Vec<RunWithOwner> {
        self.state.read().runs.values().cloned().collect()
    }

    /// Best rate first.
    pub fn by_rate(&self) -> Vec<RunWithOwner> {
        let mut runs = self.runs();
        runs.sort_by(|a, b| b.data.rate.total_cmp(&a.data.rate));
        runs
    }

    /// Newest first.
    pub fn by_recency(&self) -> Vec<RunWithOwner> {
        let mut runs = self.runs();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Shortest duration.
    pub fn fastest(&self) -> Option<RunWithOwner> {
        self.state
            .read()
            .runs
            .values()
            .min_by(|a, b| a.data.duration.total_cmp(&b.data.duration))
            .cloned()
    }

    pub fn total(&self) -> usize {
        self.state.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn is_loading(&self) -> bool {
        self.state.read().is_loading
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state.read().error.clone()
    }

    pub fn last_event_at(&self) -> Option<Instant> {
        self.state.read().last_event_at
    }

    pub fn connection_quality(&self, window: Duration) -> ConnectionQuality {
        match self.last_event_at() {
            None => ConnectionQuality::Unknown,
            Some(at) if at.elapsed() <= window => ConnectionQuality::Good,
            Some(_) => ConnectionQuality::Poor,
        }
    }
}
