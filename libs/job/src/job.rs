//! Jobs and their states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobName, Resources};

/// Desired or observed state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Inactive,
    Loaded,
    Launched,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Loaded => "loaded",
            JobState::Launched => "launched",
        }
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, JobState::Inactive)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(pub String);

impl std::str::FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "loaded" => Ok(JobState::Loaded),
            "launched" => Ok(JobState::Launched),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// Placement requirements of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    /// Resources the job reserves on its machine.
    #[serde(default)]
    pub resources: Resources,

    /// Jobs this one must not share a machine with.
    ///
    /// Entries are exact job names or prefixes ending in `*`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,

    /// Metadata a machine must carry to host this job.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_metadata: BTreeMap<String, String>,
}

impl JobRequirements {
    /// Returns true if `other` matches any of this job's conflict patterns.
    pub fn conflicts_with(&self, other: &JobName) -> bool {
        self.conflicts
            .iter()
            .any(|pattern| pattern_matches(pattern, other.as_str()))
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: JobName,

    /// Observed state. `None` until an agent reports it.
    #[serde(default)]
    pub state: Option<JobState>,

    #[serde(default)]
    pub requirements: JobRequirements,
}

impl Job {
    pub fn new(name: JobName) -> Self {
        Self {
            name,
            state: None,
            requirements: JobRequirements::default(),
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.requirements.resources = resources;
        self
    }

    pub fn with_conflict(mut self, pattern: impl Into<String>) -> Self {
        self.requirements.conflicts.push(pattern.into());
        self
    }

    pub fn with_machine_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .machine_metadata
            .insert(key.into(), value.into());
        self
    }
}
