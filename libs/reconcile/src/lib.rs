//! Reconciliation loop primitives.
//!
//! This library holds the pure decisions the engine makes on every pass.
//! Key concepts:
//!
//! - **Target state**: What the job should look like (set by submitters).
//! - **Observed state**: What the job actually looks like (reported by agents).
//! - **Convergence**: The process of making observed match target.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A decision never asks for a mutation that is already in flight (an open
//!   offer or an existing target), so repeating a pass with unchanged inputs
//!   is a no-op

use flotilla_job::{JobBid, JobState, MachineId};

/// Convergence status for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed matches target.
    Converged,

    /// Observed differs from target.
    Diverged,

    /// Target state is unknown (nothing to converge towards).
    Unknown,
}

impl ConvergenceStatus {
    /// Compares a target state with an observed state.
    ///
    /// An unknown observed state is treated as `Inactive`.
    pub fn of(target: Option<JobState>, observed: Option<JobState>) -> Self {
        match target {
            None => Self::Unknown,
            Some(t) if t == observed.unwrap_or(JobState::Inactive) => Self::Converged,
            Some(_) => Self::Diverged,
        }
    }

    /// Returns true if the job has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Why a job needs no action this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No target state recorded.
    UnknownTarget,

    /// Observed state already matches the target.
    Converged,

    /// An unresolved offer already exists.
    OfferPending,

    /// The job already has a target machine and is waiting for its agent.
    AwaitingAgent,

    /// Target is inactive and no machine is targeted.
    NothingToUnschedule,

    /// Job is active with a different active target; agents handle
    /// transitions between active states.
    AgentTransition,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnknownTarget => "unknown_target",
            SkipReason::Converged => "converged",
            SkipReason::OfferPending => "offer_pending",
            SkipReason::AwaitingAgent => "awaiting_agent",
            SkipReason::NothingToUnschedule => "nothing_to_unschedule",
            SkipReason::AgentTransition => "agent_transition",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine should do with a job this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Publish an offer for the job.
    Offer,

    /// Clear the job's assignment to this machine.
    Unschedule(MachineId),

    /// Nothing to do.
    Skip(SkipReason),
}

/// Inputs to [`plan_job`] gathered from the registry.
#[derive(Debug, Clone, Copy)]
pub struct JobObservation<'a> {
    pub target_state: Option<JobState>,
    pub observed_state: Option<JobState>,
    pub has_unresolved_offer: bool,
    pub current_target: Option<&'a MachineId>,
}

/// Decides what to do with one job.
///
/// - Unknown target, or target equal to observed: skip.
/// - Target active and observed inactive/unknown: offer, unless an offer is
///   already open or a machine is already targeted.
/// - Target inactive: unschedule from the targeted machine, if any.
pub fn plan_job(obs: JobObservation<'_>) -> JobAction {
    let Some(target) = obs.target_state else {
        return JobAction::Skip(SkipReason::UnknownTarget);
    };

    if obs.observed_state == Some(target) {
        return JobAction::Skip(SkipReason::Converged);
    }

    if target.is_inactive() {
        return match obs.current_target {
            Some(machine) => JobAction::Unschedule(machine.clone()),
            None => JobAction::Skip(SkipReason::NothingToUnschedule),
        };
    }

    let observed_inactive = obs.observed_state.map_or(true, |s| s.is_inactive());
    if !observed_inactive {
        return JobAction::Skip(SkipReason::AgentTransition);
    }

    if obs.has_unresolved_offer {
        return JobAction::Skip(SkipReason::OfferPending);
    }

    if obs.current_target.is_some() {
        return JobAction::Skip(SkipReason::AwaitingAgent);
    }

    JobAction::Offer
}

/// Picks the winning bid for an offer: the first one observed. Bids are
/// not ranked.
pub fn select_bid(bids: &[JobBid]) -> Option<&JobBid> {
    bids.first()
}
