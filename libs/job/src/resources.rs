//! Resource quantities used for placement.

use serde::{Deserialize, Serialize};

/// A bundle of schedulable resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in thousandths of a core.
    pub cpu_millis: u64,

    /// Memory in MiB.
    pub memory_mb: u64,
}

impl Resources {
    pub const ZERO: Self = Self {
        cpu_millis: 0,
        memory_mb: 0,
    };

    pub const fn new(cpu_millis: u64, memory_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
        }
    }

    /// Returns true if `self` fits inside `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu_millis <= available.cpu_millis && self.memory_mb <= available.memory_mb
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_mb == 0
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu={}m mem={}MiB", self.cpu_millis, self.memory_mb)
    }
}
