//! Registry contract.
//!
//! The registry is the shared, linearizable store every engine instance
//! coordinates through. This module defines the operations the engine
//! consumes; the store itself is an external collaborator.
//! [`MemoryRegistry`] implements the contract in-process for tests and
//! development.

mod memory;

use async_trait::async_trait;
use flotilla_events::Event;
use flotilla_job::{Job, JobBid, JobName, JobOffer, JobState, MachineId, MachineState};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::{Mutation, MemoryRegistry, DEFAULT_LOCK_TTL, LOG_CAPACITY};

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The store could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The addressed record does not exist (or is no longer in the
    /// required state).
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Failure injected by a test registry.
    #[error("injected failure in {0}")]
    Injected(RegistryOp),
}

/// Registry operations, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryOp {
    UnresolvedJobOffers,
    Bids,
    GetAllJobs,
    GetJobTargetState,
    GetJobTarget,
    ClearJobTarget,
    CreateJobOffer,
    ResolveJobOffer,
    ScheduleJob,
    LockJob,
    LockJobOffer,
    Unlock,
    GetActiveMachines,
    SubmitBid,
}

impl RegistryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryOp::UnresolvedJobOffers => "unresolved_job_offers",
            RegistryOp::Bids => "bids",
            RegistryOp::GetAllJobs => "get_all_jobs",
            RegistryOp::GetJobTargetState => "get_job_target_state",
            RegistryOp::GetJobTarget => "get_job_target",
            RegistryOp::ClearJobTarget => "clear_job_target",
            RegistryOp::CreateJobOffer => "create_job_offer",
            RegistryOp::ResolveJobOffer => "resolve_job_offer",
            RegistryOp::ScheduleJob => "schedule_job",
            RegistryOp::LockJob => "lock_job",
            RegistryOp::LockJobOffer => "lock_job_offer",
            RegistryOp::Unlock => "unlock",
            RegistryOp::GetActiveMachines => "get_active_machines",
            RegistryOp::SubmitBid => "submit_bid",
        }
    }
}

impl std::fmt::Display for RegistryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource a lock is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// Guards publishing an offer for a job.
    Job(JobName),

    /// Guards resolving the offer for a job.
    JobOffer(JobName),
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Job(name) => write!(f, "job/{}", name),
            LockKey::JobOffer(name) => write!(f, "offer/{}", name),
        }
    }
}

/// A held, expiring registry lock.
///
/// `unlock` consumes the lock, so a handle can be released at most once.
/// A lock that is never released is reclaimed by the registry when it
/// expires.
#[async_trait]
pub trait RegistryLock: Send + Sync {
    /// Resource this lock guards.
    fn key(&self) -> &LockKey;

    /// Machine holding the lock.
    fn owner(&self) -> &MachineId;

    /// Release the lock.
    async fn unlock(self: Box<Self>) -> RegistryResult<()>;
}

/// Registry operations consumed by the engine.
///
/// Lock acquisition fails closed: `Ok(None)` means another machine holds
/// the lock and the caller should abandon the attempt.
#[async_trait]
pub trait Registry: Send + Sync {
    /// All offers that have not been resolved yet.
    async fn unresolved_job_offers(&self) -> RegistryResult<Vec<JobOffer>>;

    /// Bids placed on an offer, in the order they were observed.
    async fn bids(&self, offer: &JobOffer) -> RegistryResult<Vec<JobBid>>;

    async fn get_all_jobs(&self) -> RegistryResult<Vec<Job>>;

    /// Desired state of a job, `None` if unknown.
    async fn get_job_target_state(&self, name: &JobName) -> RegistryResult<Option<JobState>>;

    /// Machine a job is scheduled to, if any.
    async fn get_job_target(&self, name: &JobName) -> RegistryResult<Option<MachineId>>;

    /// Clear a job's assignment, provided it is still assigned to `machine`.
    async fn clear_job_target(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()>;

    async fn create_job_offer(&self, offer: JobOffer) -> RegistryResult<()>;

    /// Mark the job's offer resolved. Fails with `NotFound` unless an
    /// unresolved offer exists.
    async fn resolve_job_offer(&self, name: &JobName) -> RegistryResult<()>;

    async fn schedule_job(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()>;

    async fn lock_job(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>>;

    async fn lock_job_offer(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>>;

    /// Machines currently reporting to the registry.
    async fn get_active_machines(&self) -> RegistryResult<Vec<MachineState>>;

    /// Place a bid on an unresolved offer. Only machines named in the offer
    /// may bid.
    async fn submit_bid(&self, bid: JobBid) -> RegistryResult<()>;
}

/// Change stream over registry mutations.
#[async_trait]
pub trait RegistryEventStream: Send + Sync {
    /// Deliver events starting at logical index `from_index` to `sink`
    /// until `shutdown` flips to `true` or the sink is closed.
    async fn stream(
        &self,
        from_index: u64,
        sink: mpsc::Sender<Event>,
        shutdown: watch::Receiver<bool>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_display() {
        let name = JobName::parse("web.service").unwrap();
        assert_eq!(LockKey::Job(name.clone()).to_string(), "job/web.service");
        assert_eq!(LockKey::JobOffer(name).to_string(), "offer/web.service");
    }

    #[test]
    fn test_injected_error_message() {
        let err = RegistryError::Injected(RegistryOp::CreateJobOffer);
        assert_eq!(err.to_string(), "injected failure in create_job_offer");
    }
}
