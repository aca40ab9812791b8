//! Mutation handlers.
//!
//! Every mutation follows the same pipeline:
//!
//! ```text
//! validate ──► authorize ──► persist ──► publish
//!     │            │            │
//!     ▼            ▼            ▼
//! Validation   Unauthorized  Persistence / NotFound
//!              Forbidden
//! ```
//!
//! An event is published only after storage accepted the write, and never
//! when any earlier step failed.

use std::sync::Arc;

use thiserror::Error;
use trichter_core::{validate_run_name, NewRun, RunEvent, RunWithOwner, ValidationError};

use crate::bus::RunBus;
use crate::identity::Viewer;
use crate::repository::{ClaimOutcome, RepositoryError, RunRepository};

/// Structured mutation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Persistence(String),
}

/// Who is asking for a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Anonymous,
    /// The measuring device, authenticated by its ingest credential
    Device,
    Viewer(Viewer),
}

impl Actor {
    fn is_admin(&self) -> bool {
        matches!(self, Actor::Viewer(v) if v.is_admin())
    }

    fn viewer(&self) -> Result<&Viewer, MutationError> {
        match self {
            Actor::Viewer(v) => Ok(v),
            _ => Err(MutationError::Unauthorized),
        }
    }

    fn require_admin(&self) -> Result<&Viewer, MutationError> {
        let viewer = self.viewer()?;
        if viewer.is_admin() {
            Ok(viewer)
        } else {
            Err(MutationError::Forbidden("admin role required".into()))
        }
    }
}

/// Validates, persists and publishes run mutations.
#[derive(Clone)]
pub struct RunService {
    repository: Arc<dyn RunRepository>,
    bus: RunBus,
}

impl RunService {
    pub fn new(repository: Arc<dyn RunRepository>, bus: RunBus) -> Self {
        Self { repository, bus }
    }

    pub fn bus(&self) -> &RunBus {
        &self.bus
    }

    pub async fn list_ranked(&self) -> Result<Vec<RunWithOwner>, MutationError> {
        self.repository
            .list_ranked()
            .await
            .map_err(|e| persistence("list runs", e))
    }

    /// Record a new run from the measuring device (or an admin).
    pub async fn create(&self, actor: &Actor, input: NewRun) -> Result<RunWithOwner, MutationError> {
        let valid = input.validate()?;
        match actor {
            Actor::Device => {}
            Actor::Viewer(v) if v.is_admin() => {}
            Actor::Viewer(_) => {
                return Err(MutationError::Forbidden("only the device creates runs".into()))
            }
            Actor::Anonymous => return Err(MutationError::Unauthorized),
        }

        let run = self
            .repository
            .create(valid)
            .await
            .map_err(|e| persistence("create run", e))?;
        log::info!("Run {} created (rate {:.2})", run.id, run.data.rate);
        self.publish(RunEvent::Created(run.clone()));
        Ok(run)
    }

    /// Claim an unclaimed run for the calling viewer.
    ///
    /// Admins may take over a claimed run. For everyone else the ownership
    /// check and the write happen in one repository step, so of two racing
    /// claims exactly one wins.
    pub async fn claim(&self, actor: &Actor, id: &str) -> Result<RunWithOwner, MutationError> {
        let viewer = actor.viewer()?;
        if viewer.is_admin() {
            let run = self.existing(id).await?;
            if run.user.as_ref().is_some_and(|owner| owner.id == viewer.id) {
                return Ok(run);
            }
            return self.assign(id, &viewer.id).await;
        }

        match self.repository.claim(id, &viewer.id).await {
            Ok(ClaimOutcome::Claimed(run)) => {
                log::info!("Run {id} claimed by {}", viewer.username);
                self.publish(RunEvent::Updated(run.clone()));
                Ok(run)
            }
            Ok(ClaimOutcome::AlreadyOwned(run)) => Ok(run),
            Ok(ClaimOutcome::Taken(_)) => {
                Err(MutationError::Forbidden("run is already claimed".into()))
            }
            Ok(ClaimOutcome::Missing) => Err(not_found(id)),
            Err(RepositoryError::UnknownOwner(owner)) => {
                Err(MutationError::NotFound(format!("user {owner}")))
            }
            Err(e) => Err(persistence("claim run", e)),
        }
    }

    /// Admin: hand a run to any registered user.
    pub async fn assign_owner(
        &self,
        actor: &Actor,
        id: &str,
        owner_id: &str,
    ) -> Result<RunWithOwner, MutationError> {
        actor.require_admin()?;
        self.assign(id, owner_id).await
    }

    /// Rename a run. Allowed for its owner and admins.
    pub async fn rename(&self, actor: &Actor, id: &str, name: &str) -> Result<RunWithOwner, MutationError> {
        let name = validate_run_name(name)?;
        let viewer = actor.viewer()?;
        let run = self.existing(id).await?;
        let is_owner = run.user.as_ref().is_some_and(|o| o.id == viewer.id);
        if !is_owner && !actor.is_admin() {
            return Err(MutationError::Forbidden("only the owner may rename a run".into()));
        }

        let run = self
            .repository
            .rename(id, &name)
            .await
            .map_err(|e| persistence("rename run", e))?
            .ok_or_else(|| not_found(id))?;
        log::info!("Run {id} renamed to {name:?} by {}", viewer.username);
        self.publish(RunEvent::Updated(run.clone()));
        Ok(run)
    }

    /// Admin: delete a run.
    pub async fn delete(&self, actor: &Actor, id: &str) -> Result<(), MutationError> {
        let admin = actor.require_admin()?;
        let removed = self
            .repository
            .delete(id)
            .await
            .map_err(|e| persistence("delete run", e))?;
        if !removed {
            return Err(not_found(id));
        }
        log::info!("Run {id} deleted by {}", admin.username);
        self.publish(RunEvent::deleted(id));
        Ok(())
    }

    async fn existing(&self, id: &str) -> Result<RunWithOwner, MutationError> {
        self.repository
            .get(id)
            .await
            .map_err(|e| persistence("load run", e))?
            .ok_or_else(|| not_found(id))
    }

    async fn assign(&self, id: &str, owner_id: &str) -> Result<RunWithOwner, MutationError> {
        let run = match self.repository.assign_owner(id, owner_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return Err(not_found(id)),
            Err(RepositoryError::UnknownOwner(owner)) => {
                return Err(MutationError::NotFound(format!("user {owner}")))
            }
            Err(e) => return Err(persistence("assign owner", e)),
        };
        log::info!("Run {id} assigned to {}", run.owner_name());
        self.publish(RunEvent::Updated(run.clone()));
        Ok(run)
    }

    fn publish(&self, event: RunEvent) {
        let delivered = self.bus.publish(&event);
        log::debug!("{} for {} reached {delivered} listeners", event.kind(), event.run_id());
    }
}

fn not_found(id: &str) -> MutationError {
    MutationError::NotFound(format!("run {id}"))
}

fn persistence(action: &str, e: RepositoryError) -> MutationError {
    log::error!("Failed to {action}: {e}");
    MutationError::Persistence(e.to_string())
}
