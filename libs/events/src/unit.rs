//! Unit status as reported by the local service manager, and its translation
//! into events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Event;

/// Raw status of a unit as reported by the service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

/// Normalized unit state carried on `unit.state_updated` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

impl UnitState {
    pub fn new(
        load_state: impl Into<String>,
        active_state: impl Into<String>,
        sub_state: impl Into<String>,
    ) -> Self {
        Self {
            load_state: load_state.into(),
            active_state: active_state.into(),
            sub_state: sub_state.into(),
        }
    }
}

impl From<&UnitStatus> for UnitState {
    fn from(status: &UnitStatus) -> Self {
        Self::new(&status.load_state, &status.active_state, &status.sub_state)
    }
}

/// Translates a batch of unit status changes into one event per unit.
///
/// A `None` status (unit removed or unknown) yields an event with no state.
/// Order within the batch is unspecified.
pub fn translate_unit_status_events(changes: &HashMap<String, Option<UnitStatus>>) -> Vec<Event> {
    changes
        .iter()
        .map(|(name, status)| Event::unit_state(name.clone(), status.as_ref().map(UnitState::from)))
        .collect()
}
