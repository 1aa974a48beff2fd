//! Scheduling protocol and reconciliation pass.
//!
//! Every engine instance runs the same protocol against the shared
//! registry; there is no leader. Each protocol step is guarded by one
//! registry lock:
//!
//! - Offer: lock the job, publish a [`JobOffer`] naming eligible machines.
//! - Resolve: lock the job's offer, resolve it and schedule the job on the
//!   winning bidder.
//!
//! Both locked steps re-read the job's target machine under their lock and
//! stand down if the job is already scheduled.
//! - Unschedule: clear the job's target machine. Unlocked.
//!
//! Losing a lock race is normal control flow ([`StepOutcome::Contended`]),
//! not an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flotilla_job::{Job, JobName, JobOffer, MachineId, MachineState};
use flotilla_reconcile::{plan_job, select_bid, ConvergenceStatus, JobAction, JobObservation};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{Cluster, PlacementError};
use crate::registry::{Registry, RegistryError, RegistryLock, RegistryOp};

/// Result of a locked protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran to completion.
    Completed,

    /// Another machine holds the lock; the step was abandoned.
    Contended,

    /// The job already had a target machine; nothing was scheduled or offered.
    AlreadyScheduled,
}

/// Errors from a protocol step.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("{op} failed for {resource}: {source}")]
    Persistence {
        op: RegistryOp,
        resource: String,
        #[source]
        source: RegistryError,
    },
}

impl EngineError {
    fn persistence(op: RegistryOp, resource: impl ToString, source: RegistryError) -> Self {
        EngineError::Persistence {
            op,
            resource: resource.to_string(),
            source,
        }
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub offers_resolved: usize,
    pub offers_created: usize,
    pub jobs_unscheduled: usize,
    pub jobs_converged: usize,
    pub steps_contended: usize,
    pub steps_already_scheduled: usize,
    pub failures: usize,
}

/// A scheduling engine bound to one machine.
pub struct Engine {
    registry: Arc<dyn Registry>,
    machine: MachineState,

    /// Load view; also serializes passes.
    cluster: Mutex<Cluster>,
}

impl Engine {
    pub fn new(registry: Arc<dyn Registry>, machine: MachineState, cluster: Cluster) -> Self {
        Self {
            registry,
            machine,
            cluster: Mutex::new(cluster),
        }
    }

    /// Machine this engine acts for.
    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine.id
    }

    // =========================================================================
    // Protocol steps
    // =========================================================================

    /// Publish an offer for `job` to the machines `cluster` deems eligible.
    pub async fn offer_job(&self, cluster: &Cluster, job: &Job) -> Result<StepOutcome, EngineError> {
        let lock = self
            .registry
            .lock_job(&job.name, self.machine_id())
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::LockJob, &job.name, e))?;

        let Some(lock) = lock else {
            debug!(job = %job.name, "Job lock held elsewhere, skipping offer");
            return Ok(StepOutcome::Contended);
        };

        let result = self.publish_offer(cluster, job).await;
        self.release(lock).await;
        result
    }

    async fn publish_offer(
        &self,
        cluster: &Cluster,
        job: &Job,
    ) -> Result<StepOutcome, EngineError> {
        if let Some(target) = self.current_target(&job.name).await? {
            debug!(job = %job.name, machine_id = %target, "Job already scheduled, skipping offer");
            return Ok(StepOutcome::AlreadyScheduled);
        }

        let machine_ids = cluster.partition(job)?;
        let candidates = machine_ids.len();

        let offer = JobOffer::from_job(job.clone(), machine_ids);
        self.registry
            .create_job_offer(offer)
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::CreateJobOffer, &job.name, e))?;

        info!(job = %job.name, candidates, "Published job offer");
        Ok(StepOutcome::Completed)
    }

    /// Resolve the offer for `job_name` in favour of `machine_id` and
    /// schedule the job there.
    pub async fn resolve_job_offer(
        &self,
        job_name: &JobName,
        machine_id: &MachineId,
    ) -> Result<StepOutcome, EngineError> {
        let lock = self
            .registry
            .lock_job_offer(job_name, self.machine_id())
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::LockJobOffer, job_name, e))?;

        let Some(lock) = lock else {
            debug!(job = %job_name, "Offer lock held elsewhere, skipping resolution");
            return Ok(StepOutcome::Contended);
        };

        let result = self.resolve_and_schedule(job_name, machine_id).await;
        self.release(lock).await;
        result
    }

    async fn resolve_and_schedule(
        &self,
        job_name: &JobName,
        machine_id: &MachineId,
    ) -> Result<StepOutcome, EngineError> {
        self.registry
            .resolve_job_offer(job_name)
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::ResolveJobOffer, job_name, e))?;
        info!(job = %job_name, "Resolved job offer");

        // A stale offer can outlive a schedule made under an earlier offer.
        if let Some(target) = self.current_target(job_name).await? {
            warn!(
                job = %job_name,
                machine_id = %target,
                bidder = %machine_id,
                "Job already scheduled, closing offer without scheduling"
            );
            return Ok(StepOutcome::AlreadyScheduled);
        }

        self.registry
            .schedule_job(job_name, machine_id)
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::ScheduleJob, job_name, e))?;
        info!(job = %job_name, machine_id = %machine_id, "Scheduled job");

        Ok(StepOutcome::Completed)
    }

    async fn current_target(&self, name: &JobName) -> Result<Option<MachineId>, EngineError> {
        self.registry
            .get_job_target(name)
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::GetJobTarget, name, e))
    }

    /// Clear the target machine of `name`.
    ///
    /// Returns the machine the job was removed from, or `None` if it had no
    /// target.
    pub async fn unschedule_job(&self, name: &JobName) -> Result<Option<MachineId>, EngineError> {
        let Some(machine) = self.current_target(name).await? else {
            debug!(job = %name, "Job has no target machine, nothing to unschedule");
            return Ok(None);
        };

        self.registry
            .clear_job_target(name, &machine)
            .await
            .map_err(|e| EngineError::persistence(RegistryOp::ClearJobTarget, name, e))?;

        info!(job = %name, machine_id = %machine, "Unscheduled job");
        Ok(Some(machine))
    }

    async fn release(&self, lock: Box<dyn RegistryLock>) {
        let key = lock.key().clone();
        if let Err(e) = lock.unlock().await {
            warn!(lock = %key, error = %e, "Failed to release lock, leaving it to expire");
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Run one reconciliation pass.
    ///
    /// Resolves every unresolved offer that has bids, then offers or
    /// unschedules each job according to [`plan_job`]. Errors are logged
    /// per item and counted; a pass never aborts.
    #[instrument(skip(self), fields(machine_id = %self.machine.id))]
    pub async fn reconcile(&self) -> ReconcileStats {
        let mut cluster = self.cluster.lock().await;
        let mut stats = ReconcileStats::default();

        debug!("Starting reconciliation pass");

        let jobs = match self.registry.get_all_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to list jobs");
                stats.failures += 1;
                Vec::new()
            }
        };

        // Settle offers first so the targets read below include this pass's
        // resolutions.
        let open_offers = self.resolve_offers(&mut stats).await;

        // Jobs whose target could not be read are left alone this pass.
        let mut targets: HashMap<JobName, Option<MachineId>> = HashMap::with_capacity(jobs.len());
        for job in &jobs {
            match self.registry.get_job_target(&job.name).await {
                Ok(target) => {
                    targets.insert(job.name.clone(), target);
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Failed to read job target");
                    stats.failures += 1;
                }
            }
        }

        let placements = jobs.iter().filter_map(|job| {
            targets
                .get(&job.name)
                .and_then(|t| t.as_ref())
                .map(|machine| (job, machine))
        });
        match self.registry.get_active_machines().await {
            Ok(machines) => cluster.rebuild(machines, placements),
            Err(e) => {
                warn!(error = %e, "Failed to list machines, keeping previous cluster view");
                stats.failures += 1;
                for (job, machine) in placements {
                    cluster.track_job(job, machine);
                }
            }
        }

        for job in &jobs {
            let Some(current_target) = targets.get(&job.name) else {
                continue;
            };

            let target_state = match self.registry.get_job_target_state(&job.name).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Failed to read job target state");
                    stats.failures += 1;
                    continue;
                }
            };

            if ConvergenceStatus::of(target_state, job.state).is_converged() {
                stats.jobs_converged += 1;
            }

            // If offers could not be listed, assume one is open.
            let has_unresolved_offer = open_offers
                .as_ref()
                .map_or(true, |open| open.contains(&job.name));

            let action = plan_job(JobObservation {
                target_state,
                observed_state: job.state,
                has_unresolved_offer,
                current_target: current_target.as_ref(),
            });

            match action {
                JobAction::Offer => match self.offer_job(&cluster, job).await {
                    Ok(StepOutcome::Completed) => stats.offers_created += 1,
                    Ok(StepOutcome::Contended) => stats.steps_contended += 1,
                    Ok(StepOutcome::AlreadyScheduled) => stats.steps_already_scheduled += 1,
                    Err(EngineError::Placement(e)) => {
                        warn!(job = %job.name, error = %e, "Unable to place job");
                        stats.failures += 1;
                    }
                    Err(e) => {
                        warn!(job = %job.name, error = %e, "Failed to offer job");
                        stats.failures += 1;
                    }
                },
                JobAction::Unschedule(machine) => {
                    debug!(job = %job.name, machine_id = %machine, "Job target is inactive");
                    match self.unschedule_job(&job.name).await {
                        Ok(Some(_)) => {
                            cluster.untrack_job(&job.name);
                            stats.jobs_unscheduled += 1;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(job = %job.name, error = %e, "Failed to unschedule job");
                            stats.failures += 1;
                        }
                    }
                }
                JobAction::Skip(reason) => {
                    debug!(job = %job.name, reason = %reason, "No action for job");
                }
            }
        }

        info!(
            offers_resolved = stats.offers_resolved,
            offers_created = stats.offers_created,
            jobs_unscheduled = stats.jobs_unscheduled,
            jobs_converged = stats.jobs_converged,
            steps_contended = stats.steps_contended,
            steps_already_scheduled = stats.steps_already_scheduled,
            failures = stats.failures,
            "Reconciliation pass complete"
        );

        stats
    }

    /// Resolve every unresolved offer that has at least one bid.
    ///
    /// Returns the names of offers still open afterwards, or `None` if the
    /// offers could not be listed.
    async fn resolve_offers(&self, stats: &mut ReconcileStats) -> Option<HashSet<JobName>> {
        let offers = match self.registry.unresolved_job_offers().await {
            Ok(offers) => offers,
            Err(e) => {
                warn!(error = %e, "Failed to list unresolved job offers");
                stats.failures += 1;
                return None;
            }
        };

        let mut open: HashSet<JobName> = offers.iter().map(|o| o.job_name().clone()).collect();

        for offer in &offers {
            let name = offer.job_name();

            let bids = match self.registry.bids(offer).await {
                Ok(bids) => bids,
                Err(e) => {
                    warn!(job = %name, error = %e, "Failed to list bids");
                    stats.failures += 1;
                    continue;
                }
            };

            let Some(bid) = select_bid(&bids) else {
                debug!(job = %name, "No bids on offer yet");
                continue;
            };

            match self.resolve_job_offer(name, &bid.machine_id).await {
                Ok(StepOutcome::Completed) => {
                    open.remove(name);
                    stats.offers_resolved += 1;
                }
                Ok(StepOutcome::Contended) => stats.steps_contended += 1,
                Ok(StepOutcome::AlreadyScheduled) => {
                    open.remove(name);
                    stats.steps_already_scheduled += 1;
                }
                Err(e) => {
                    warn!(job = %name, machine_id = %bid.machine_id, error = %e, "Failed to resolve job offer");
                    stats.failures += 1;
                }
            }
        }

        Some(open)
    }
}
