//! Machine identity and reported state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MachineId, Resources};

/// A machine as it reports itself to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub id: MachineId,

    /// Total schedulable capacity.
    #[serde(default)]
    pub capacity: Resources,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MachineState {
    pub fn new(id: MachineId, capacity: Resources) -> Self {
        Self {
            id,
            capacity,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if every required key/value pair is present.
    pub fn has_metadata(&self, required: &BTreeMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.metadata.get(k).is_some_and(|have| have == v))
    }
}
