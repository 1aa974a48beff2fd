//! Offers and bids.

use serde::{Deserialize, Serialize};

use crate::{Job, JobName, MachineId};

/// A job published for bidding among the machines eligible to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOffer {
    pub job: Job,

    /// Eligible machines, best candidate first.
    pub machine_ids: Vec<MachineId>,
}

impl JobOffer {
    pub fn from_job(job: Job, machine_ids: Vec<MachineId>) -> Self {
        Self { job, machine_ids }
    }

    pub fn job_name(&self) -> &JobName {
        &self.job.name
    }

    /// Returns true if `machine` was offered this job.
    pub fn is_candidate(&self, machine: &MachineId) -> bool {
        self.machine_ids.contains(machine)
    }
}

/// A machine's claim to run an offered job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobBid {
    pub job_name: JobName,
    pub machine_id: MachineId,
}

impl JobBid {
    pub fn new(job_name: JobName, machine_id: MachineId) -> Self {
        Self {
            job_name,
            machine_id,
        }
    }
}
