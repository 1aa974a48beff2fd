//! Event kind definitions.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Kind Constants
// =============================================================================

/// All event kind names as constants.
pub mod event_kinds {
    // Job
    pub const JOB_CREATED: &str = "job.created";
    pub const JOB_STATE_UPDATED: &str = "job.state_updated";
    pub const JOB_TARGET_STATE_CHANGED: &str = "job.target_state_changed";
    pub const JOB_SCHEDULED: &str = "job.scheduled";
    pub const JOB_UNSCHEDULED: &str = "job.unscheduled";

    // Offers and bids
    pub const JOB_OFFER_CREATED: &str = "job_offer.created";
    pub const JOB_OFFER_RESOLVED: &str = "job_offer.resolved";
    pub const JOB_BID_SUBMITTED: &str = "job_bid.submitted";

    // Machine
    pub const MACHINE_UPDATED: &str = "machine.updated";

    // Local service manager
    pub const UNIT_STATE_UPDATED: &str = "unit.state_updated";
}

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    JobCreated,
    JobStateUpdated,
    JobTargetStateChanged,
    JobScheduled,
    JobUnscheduled,
    JobOfferCreated,
    JobOfferResolved,
    JobBidSubmitted,
    MachineUpdated,
    UnitStateUpdated,
}

impl EventKind {
    /// Returns the canonical name of this kind.
    pub fn as_str(&self) -> &'static str {
        use event_kinds::*;
        match self {
            EventKind::JobCreated => JOB_CREATED,
            EventKind::JobStateUpdated => JOB_STATE_UPDATED,
            EventKind::JobTargetStateChanged => JOB_TARGET_STATE_CHANGED,
            EventKind::JobScheduled => JOB_SCHEDULED,
            EventKind::JobUnscheduled => JOB_UNSCHEDULED,
            EventKind::JobOfferCreated => JOB_OFFER_CREATED,
            EventKind::JobOfferResolved => JOB_OFFER_RESOLVED,
            EventKind::JobBidSubmitted => JOB_BID_SUBMITTED,
            EventKind::MachineUpdated => MACHINE_UPDATED,
            EventKind::UnitStateUpdated => UNIT_STATE_UPDATED,
        }
    }

    /// Returns true for events produced by the registry change stream.
    pub fn is_registry(&self) -> bool {
        !matches!(self, EventKind::UnitStateUpdated)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use event_kinds::*;
        let kind = match s {
            JOB_CREATED => EventKind::JobCreated,
            JOB_STATE_UPDATED => EventKind::JobStateUpdated,
            JOB_TARGET_STATE_CHANGED => EventKind::JobTargetStateChanged,
            JOB_SCHEDULED => EventKind::JobScheduled,
            JOB_UNSCHEDULED => EventKind::JobUnscheduled,
            JOB_OFFER_CREATED => EventKind::JobOfferCreated,
            JOB_OFFER_RESOLVED => EventKind::JobOfferResolved,
            JOB_BID_SUBMITTED => EventKind::JobBidSubmitted,
            MACHINE_UPDATED => EventKind::MachineUpdated,
            UNIT_STATE_UPDATED => EventKind::UnitStateUpdated,
            other => return Err(EventError::UnknownKind(other.to_string())),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for EventKind {
    type Error = EventError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}
