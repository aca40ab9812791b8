//! Run storage collaborator.
//!
//! The leaderboard only needs a handful of operations from storage; they
//! are expressed as a trait so the mutation service can run against any
//! backend. [`MemoryRunRepository`] is the in-process implementation used by
//! the server binary and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{self, BoxFuture};
use parking_lot::RwLock;
use thiserror::Error;
use trichter_core::{Owner, RunWithOwner, ValidRun};
use uuid::Uuid;

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("unknown owner {0}")]
    UnknownOwner(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result of a conditional claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The run was unclaimed and now belongs to the caller.
    Claimed(RunWithOwner),
    /// The caller already owned the run; nothing changed.
    AlreadyOwned(RunWithOwner),
    /// Someone else owns the run; nothing changed.
    Taken(RunWithOwner),
    Missing,
}

/// Persistent storage of runs and their owners.
///
/// Mutating operations return `Ok(None)` when the run does not exist.
pub trait RunRepository: Send + Sync {
    /// All runs, best rate first.
    fn list_ranked(&self) -> BoxFuture<'_, Result<Vec<RunWithOwner>, RepositoryError>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>>;

    fn create(&self, run: ValidRun) -> BoxFuture<'_, Result<RunWithOwner, RepositoryError>>;

    fn assign_owner<'a>(
        &'a self,
        id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>>;

    /// Set the owner only if the run is currently unclaimed, as one atomic
    /// step.
    fn claim<'a>(
        &'a self,
        id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<ClaimOutcome, RepositoryError>>;

    fn rename<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>>;

    /// Returns whether a run was removed.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, RepositoryError>>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, RunWithOwner>,
    users: HashMap<String, Owner>,
}

/// In-memory repository. Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct MemoryRunRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `owner` known so runs can be assigned to it.
    pub fn register_user(&self, owner: Owner) {
        self.state.write().users.insert(owner.id.clone(), owner);
    }

    pub fn user(&self, id: &str) -> Option<Owner> {
        self.state.read().users.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a fully formed record as is (seeding, tests).
    pub fn insert(&self, run: RunWithOwner) {
        self.state.write().runs.insert(run.id.clone(), run);
    }

    fn ranked(&self) -> Vec<RunWithOwner> {
        let mut runs: Vec<RunWithOwner> = self.state.read().runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            b.data
                .rate
                .total_cmp(&a.data.rate)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        runs
    }

    fn create_now(&self, run: ValidRun) -> Result<RunWithOwner, RepositoryError> {
        let mut state = self.state.write();
        let user = match run.user_id {
            Some(user_id) => Some(
                state
                    .users
                    .get(&user_id)
                    .cloned()
                    .ok_or(RepositoryError::UnknownOwner(user_id))?,
            ),
            None => None,
        };
        let record = RunWithOwner {
            id: Uuid::new_v4().to_string(),
            name: None,
            data: run.data,
            image: run.image,
            created_at: Utc::now(),
            user,
        };
        state.runs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn assign_now(&self, id: &str, owner_id: &str) -> Result<Option<RunWithOwner>, RepositoryError> {
        let mut state = self.state.write();
        let owner = state
            .users
            .get(owner_id)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownOwner(owner_id.to_string()))?;
        Ok(state.runs.get_mut(id).map(|run| {
            run.user = Some(owner);
            run.clone()
        }))
    }

    fn claim_now(&self, id: &str, owner_id: &str) -> Result<ClaimOutcome, RepositoryError> {
        let mut state = self.state.write();
        let owner = state
            .users
            .get(owner_id)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownOwner(owner_id.to_string()))?;
        let Some(run) = state.runs.get_mut(id) else {
            return Ok(ClaimOutcome::Missing);
        };
        Ok(match &run.user {
            Some(current) if current.id == owner_id => ClaimOutcome::AlreadyOwned(run.clone()),
            Some(_) => ClaimOutcome::Taken(run.clone()),
            None => {
                run.user = Some(owner);
                ClaimOutcome::Claimed(run.clone())
            }
        })
    }

    fn rename_now(&self, id: &str, name: &str) -> Option<RunWithOwner> {
        self.state.write().runs.get_mut(id).map(|run| {
            run.name = Some(name.to_string());
            run.clone()
        })
    }
}

impl RunRepository for MemoryRunRepository {
    fn list_ranked(&self) -> BoxFuture<'_, Result<Vec<RunWithOwner>, RepositoryError>> {
        Box::pin(future::ready(Ok(self.ranked())))
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>> {
        Box::pin(future::ready(Ok(self.state.read().runs.get(id).cloned())))
    }

    fn create(&self, run: ValidRun) -> BoxFuture<'_, Result<RunWithOwner, RepositoryError>> {
        Box::pin(future::ready(self.create_now(run)))
    }

    fn assign_owner<'a>(
        &'a self,
        id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>> {
        Box::pin(future::ready(self.assign_now(id, owner_id)))
    }

    fn claim<'a>(
        &'a self,
        id: &'a str,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<ClaimOutcome, RepositoryError>> {
        Box::pin(future::ready(self.claim_now(id, owner_id)))
    }

    fn rename<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<RunWithOwner>, RepositoryError>> {
        Box::pin(future::ready(Ok(self.rename_now(id, name))))
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, RepositoryError>> {
        Box::pin(future::ready(Ok(self.state.write().runs.remove(id).is_some())))
    }
}
