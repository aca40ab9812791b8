//! Run mutation events.
//!
//! The set is closed: a run is created, updated (claimed, renamed,
//! re-assigned) or deleted. Each [`RunEvent`] variant fixes both the kind
//! and the payload type, so a `RunDeleted` kind can never travel with a
//! full record and vice versa.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::RunWithOwner;

/// Tag of a run event. Doubles as the wire event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RunCreated,
    RunUpdated,
    RunDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::RunCreated,
        EventKind::RunUpdated,
        EventKind::RunDeleted,
    ];

    /// Event name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::RunCreated => "run-created",
            EventKind::RunUpdated => "run-updated",
            EventKind::RunDeleted => "run-deleted",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "run-created" => Some(EventKind::RunCreated),
            "run-updated" => Some(EventKind::RunUpdated),
            "run-deleted" => Some(EventKind::RunDeleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Payload of a deletion: only the id survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDeleted {
    pub id: String,
}

/// A run mutation, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Created(RunWithOwner),
    Updated(RunWithOwner),
    Deleted(RunDeleted),
}

impl RunEvent {
    pub fn deleted(id: impl Into<String>) -> Self {
        RunEvent::Deleted(RunDeleted { id: id.into() })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            RunEvent::Created(_) => EventKind::RunCreated,
            RunEvent::Updated(_) => EventKind::RunUpdated,
            RunEvent::Deleted(_) => EventKind::RunDeleted,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::Created(run) | RunEvent::Updated(run) => &run.id,
            RunEvent::Deleted(d) => &d.id,
        }
    }

    /// JSON of the payload alone (the envelope kind travels separately).
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            RunEvent::Created(run) | RunEvent::Updated(run) => serde_json::to_string(run),
            RunEvent::Deleted(d) => serde_json::to_string(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(EventKind::from_wire_name("run-archived"), None);
    }

    #[test]
    fn test_deleted_payload_carries_only_id() {
        let event = RunEvent::deleted("r9");
        assert_eq!(event.kind(), EventKind::RunDeleted);
        assert_eq!(event.run_id(), "r9");
        assert_eq!(event.payload_json().unwrap(), r#"{"id":"r9"}"#);
    }

    #[test]
    fn test_display_uses_wire_name() {
        assert_eq!(EventKind::RunUpdated.to_string(), "run-updated");
    }
}
