//! The event record delivered to the event bus.

use serde::{Deserialize, Serialize};

use crate::{EventKind, UnitState};

/// A typed notification about a change to one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,

    /// Normalized unit state, for unit-state events only.
    ///
    /// `None` on a unit-state event means the unit was removed or is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<UnitState>,

    /// Identifier of the subject (job name, machine ID or unit name).
    pub subject: String,
}

impl Event {
    /// Creates an event without a payload.
    pub fn new(kind: EventKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            state: None,
            subject: subject.into(),
        }
    }

    /// Creates a unit-state event.
    pub fn unit_state(subject: impl Into<String>, state: Option<UnitState>) -> Self {
        Self {
            kind: EventKind::UnitStateUpdated,
            state,
            subject: subject.into(),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event(kind={}, subject={})", self.kind, self.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let ev = Event::new(EventKind::JobOfferCreated, "web.service");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "job_offer.created", "subject": "web.service"})
        );
    }

    #[test]
    fn test_unit_state_event_roundtrip() {
        let ev = Event::unit_state(
            "foo.service",
            Some(UnitState::new("loaded", "active", "running")),
        );
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ev);
    }

    #[test]
    fn test_display() {
        let ev = Event::new(EventKind::JobScheduled, "db.service");
        assert_eq!(ev.to_string(), "Event(kind=job.scheduled, subject=db.service)");
    }
}
