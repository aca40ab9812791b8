//! # trichter-core — Shared data model for the Trichter leaderboard
//!
//! Types shared by the server (mutation handlers, fan-out) and the
//! viewer-side replica. Nothing here performs I/O.
//!
//! ## Modules
//!
//! - [`model`] — Runs, owners, measurement validation
//! - [`events`] — The closed set of run mutation events

pub mod events;
pub mod model;

pub use events::{EventKind, RunDeleted, RunEvent};
pub use model::{
    validate_run_name, NewRun, Owner, RunData, RunWithOwner, ValidRun, ValidationError,
    PLACEHOLDER_IMAGE,
};
