//! Integration tests for the scheduling protocol.
//!
//! These drive one or more engines against a shared in-memory registry and
//! check the registry's mutation log and lock traffic.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flotilla_engine::registry::{LockKey, Mutation, RegistryLock, RegistryOp, RegistryResult};
use flotilla_engine::{Cluster, Engine, MemoryRegistry, ReconcileStats, Registry};
use flotilla_job::{
    Job, JobBid, JobName, JobOffer, JobState, MachineId, MachineState, Resources,
};

fn name(s: &str) -> JobName {
    JobName::parse(s).unwrap()
}

fn mid(s: &str) -> MachineId {
    MachineId::parse(s).unwrap()
}

fn machine(s: &str) -> MachineState {
    MachineState::new(mid(s), Resources::new(1000, 1024))
}

fn engine_for(registry: &MemoryRegistry, id: &str) -> Engine {
    Engine::new(Arc::new(registry.clone()), machine(id), Cluster::new())
}

/// Registry with two machines and one inactive job that should be launched.
fn seeded(job: &str) -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry.register_machine(machine("m1"));
    registry.register_machine(machine("m2"));
    registry.create_job(Job::new(name(job)).with_state(JobState::Inactive));
    registry.set_job_target_state(&name(job), JobState::Launched);
    registry
}

fn count(mutations: &[Mutation], pred: impl Fn(&Mutation) -> bool) -> usize {
    mutations.iter().filter(|m| pred(m)).count()
}

fn assert_locks_released(registry: &MemoryRegistry, job: &JobName) {
    for key in [LockKey::Job(job.clone()), LockKey::JobOffer(job.clone())] {
        assert!(!registry.is_locked(&key), "{key} still held");
        assert_eq!(
            registry.lock_acquisitions(&key),
            registry.unlock_count(&key),
            "unbalanced lock traffic on {key}"
        );
    }
}

/// Registry that runs a peer engine's pass the first time a job is
/// scheduled, before the schedule is written.
struct PeerPassBeforeSchedule {
    inner: MemoryRegistry,
    peer: Engine,
    fired: AtomicBool,
    peer_stats: Mutex<Option<ReconcileStats>>,
}

impl PeerPassBeforeSchedule {
    fn new(inner: &MemoryRegistry, peer_id: &str) -> Self {
        Self {
            inner: inner.clone(),
            peer: engine_for(inner, peer_id),
            fired: AtomicBool::new(false),
            peer_stats: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Registry for PeerPassBeforeSchedule {
    async fn unresolved_job_offers(&self) -> RegistryResult<Vec<JobOffer>> {
        self.inner.unresolved_job_offers().await
    }

    async fn bids(&self, offer: &JobOffer) -> RegistryResult<Vec<JobBid>> {
        self.inner.bids(offer).await
    }

    async fn get_all_jobs(&self) -> RegistryResult<Vec<Job>> {
        self.inner.get_all_jobs().await
    }

    async fn get_job_target_state(&self, name: &JobName) -> RegistryResult<Option<JobState>> {
        self.inner.get_job_target_state(name).await
    }

    async fn get_job_target(&self, name: &JobName) -> RegistryResult<Option<MachineId>> {
        self.inner.get_job_target(name).await
    }

    async fn clear_job_target(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()> {
        self.inner.clear_job_target(name, machine).await
    }

    async fn create_job_offer(&self, offer: JobOffer) -> RegistryResult<()> {
        self.inner.create_job_offer(offer).await
    }

    async fn resolve_job_offer(&self, name: &JobName) -> RegistryResult<()> {
        self.inner.resolve_job_offer(name).await
    }

    async fn schedule_job(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let stats = self.peer.reconcile().await;
            *self.peer_stats.lock().unwrap() = Some(stats);
        }
        self.inner.schedule_job(name, machine).await
    }

    async fn lock_job(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>> {
        self.inner.lock_job(name, owner).await
    }

    async fn lock_job_offer(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>> {
        self.inner.lock_job_offer(name, owner).await
    }

    async fn get_active_machines(&self) -> RegistryResult<Vec<MachineState>> {
        self.inner.get_active_machines().await
    }

    async fn submit_bid(&self, bid: JobBid) -> RegistryResult<()> {
        self.inner.submit_bid(bid).await
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_new_job_is_offered_once() {
    let registry = seeded("web.service");
    let engine = engine_for(&registry, "m1");

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 1);
    assert_eq!(stats.failures, 0);

    let offers = registry.unresolved_job_offers().await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].job_name(), &name("web.service"));
    assert_eq!(offers[0].machine_ids, vec![mid("m1"), mid("m2")]);

    // Nothing changed, so the next pass writes nothing.
    let before = registry.mutations();
    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 0);
    assert_eq!(registry.mutations(), before);

    assert_locks_released(&registry, &name("web.service"));
}

#[tokio::test]
async fn test_single_machine_job_offered_to_it() {
    let registry = MemoryRegistry::new();
    registry.register_machine(machine("m1"));
    let job = name("web.service");
    registry.create_job(Job::new(job.clone()).with_state(JobState::Inactive));
    registry.set_job_target_state(&job, JobState::Launched);

    let stats = engine_for(&registry, "m1").reconcile().await;
    assert_eq!(stats.offers_created, 1);

    let offers = registry.unresolved_job_offers().await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].machine_ids, vec![mid("m1")]);
}

#[tokio::test]
async fn test_bid_resolves_offer_and_schedules() {
    let registry = seeded("web.service");
    let engine = engine_for(&registry, "m1");
    let job = name("web.service");

    engine.reconcile().await;
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m2")))
        .await
        .unwrap();

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_resolved, 1);
    assert_eq!(stats.offers_created, 0);
    assert_eq!(registry.offer_resolved(&job), Some(true));
    assert_eq!(registry.get_job_target(&job).await.unwrap(), Some(mid("m2")));

    let mutations = registry.mutations();
    assert_eq!(
        &mutations[mutations.len() - 2..],
        &[
            Mutation::ResolveJobOffer(job.clone()),
            Mutation::ScheduleJob(job.clone(), mid("m2")),
        ]
    );

    // Waiting for the agent: no new offer, no writes.
    let before = registry.mutations();
    engine.reconcile().await;
    assert_eq!(registry.mutations(), before);

    assert_locks_released(&registry, &job);
}

#[tokio::test]
async fn test_teardown_unschedules() {
    let registry = seeded("web.service");
    let engine = engine_for(&registry, "m1");
    let job = name("web.service");

    engine.reconcile().await;
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m1")))
        .await
        .unwrap();
    engine.reconcile().await;

    registry.set_job_state(&job, Some(JobState::Launched)).unwrap();
    registry.set_job_target_state(&job, JobState::Inactive);

    let stats = engine.reconcile().await;
    assert_eq!(stats.jobs_unscheduled, 1);
    assert_eq!(registry.get_job_target(&job).await.unwrap(), None);
    assert_eq!(
        registry.mutations().last(),
        Some(&Mutation::ClearJobTarget(job.clone(), mid("m1")))
    );

    let before = registry.mutations();
    let stats = engine.reconcile().await;
    assert_eq!(stats.jobs_unscheduled, 0);
    assert_eq!(registry.mutations(), before);
}

#[tokio::test]
async fn test_converged_and_unknown_targets_are_left_alone() {
    let registry = MemoryRegistry::new();
    registry.register_machine(machine("m1"));
    registry.create_job(Job::new(name("done.service")).with_state(JobState::Launched));
    registry.set_job_target_state(&name("done.service"), JobState::Launched);
    registry.create_job(Job::new(name("orphan.service")));

    let stats = engine_for(&registry, "m1").reconcile().await;
    assert_eq!(stats.jobs_converged, 1);
    assert_eq!(stats.offers_created, 0);
    assert!(registry.mutations().is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_engines_offer_at_most_once() {
    let registry = seeded("web.service");
    let engines: Vec<Arc<Engine>> = ["m1", "m2", "m3", "m4", "m5"]
        .iter()
        .map(|id| Arc::new(engine_for(&registry, id)))
        .collect();

    let handles: Vec<_> = engines
        .iter()
        .map(|e| {
            let e = Arc::clone(e);
            tokio::spawn(async move { e.reconcile().await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        created += handle.await.unwrap().offers_created;
    }

    let mutations = registry.mutations();
    assert_eq!(created, 1);
    assert_eq!(
        count(&mutations, |m| matches!(m, Mutation::CreateJobOffer(_))),
        1
    );
    assert_locks_released(&registry, &name("web.service"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_engines_resolve_at_most_once() {
    let registry = seeded("web.service");
    let job = name("web.service");

    engine_for(&registry, "m1").reconcile().await;
    for bidder in ["m2", "m1"] {
        registry
            .submit_bid(JobBid::new(job.clone(), mid(bidder)))
            .await
            .unwrap();
    }

    let handles: Vec<_> = ["m1", "m2", "m3", "m4", "m5"]
        .iter()
        .map(|id| {
            let engine = engine_for(&registry, id);
            tokio::spawn(async move { engine.reconcile().await })
        })
        .collect();

    let mut resolved = 0;
    for handle in handles {
        resolved += handle.await.unwrap().offers_resolved;
    }

    let mutations = registry.mutations();
    assert_eq!(resolved, 1);
    assert_eq!(
        count(&mutations, |m| matches!(m, Mutation::ResolveJobOffer(_))),
        1
    );
    assert_eq!(
        count(&mutations, |m| matches!(m, Mutation::ScheduleJob(..))),
        1
    );
    assert_eq!(registry.get_job_target(&job).await.unwrap(), Some(mid("m2")));
    assert_locks_released(&registry, &job);
}

#[tokio::test]
async fn test_peer_pass_during_schedule_does_not_reschedule() {
    let registry = seeded("web.service");
    registry.register_machine(machine("m3"));
    let job = name("web.service");

    let window = Arc::new(PeerPassBeforeSchedule::new(&registry, "m2"));
    let engine = Engine::new(window.clone(), machine("m1"), Cluster::new());

    engine.reconcile().await;
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m2")))
        .await
        .unwrap();

    // The peer runs after the offer is resolved but before the target is
    // written, so it sees an unscheduled job with no open offer.
    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_resolved, 1);
    let peer_stats = window.peer_stats.lock().unwrap().take().unwrap();
    assert_eq!(peer_stats.offers_created, 1);

    // A bid on the peer's offer must not move the job.
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m3")))
        .await
        .unwrap();
    let stats = window.peer.reconcile().await;
    assert_eq!(stats.offers_resolved, 0);
    assert_eq!(stats.steps_already_scheduled, 1);
    assert_eq!(stats.offers_created, 0);

    let mutations = registry.mutations();
    assert_eq!(
        count(&mutations, |m| matches!(m, Mutation::ScheduleJob(..))),
        1
    );
    assert_eq!(registry.get_job_target(&job).await.unwrap(), Some(mid("m2")));
    assert!(registry.unresolved_job_offers().await.unwrap().is_empty());
    assert_locks_released(&registry, &job);

    // Settled: further passes on either machine write nothing.
    let before = registry.mutations();
    engine.reconcile().await;
    window.peer.reconcile().await;
    assert_eq!(registry.mutations(), before);
}

#[tokio::test]
async fn test_resolution_contended_while_offer_locked() {
    let registry = seeded("web.service");
    let job = name("web.service");
    let engine = engine_for(&registry, "m1");

    engine.reconcile().await;
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m1")))
        .await
        .unwrap();

    let held = registry.lock_job_offer(&job, &mid("m9")).await.unwrap().unwrap();

    let stats = engine.reconcile().await;
    assert_eq!(stats.steps_contended, 1);
    assert_eq!(stats.offers_resolved, 0);
    assert_eq!(registry.offer_resolved(&job), Some(false));

    held.unlock().await.unwrap();

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_resolved, 1);
    assert_eq!(registry.get_job_target(&job).await.unwrap(), Some(mid("m1")));
}

// =============================================================================
// Lock hygiene and failures
// =============================================================================

#[tokio::test]
async fn test_failed_publish_releases_job_lock() {
    let registry = seeded("web.service");
    registry.fail_on(RegistryOp::CreateJobOffer);
    let engine = engine_for(&registry, "m1");

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 0);
    assert_eq!(stats.failures, 1);
    assert_locks_released(&registry, &name("web.service"));

    registry.clear_failures();
    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 1);
    assert_locks_released(&registry, &name("web.service"));
}

#[tokio::test]
async fn test_failed_resolution_releases_offer_lock() {
    let registry = seeded("web.service");
    let job = name("web.service");
    let engine = engine_for(&registry, "m1");

    engine.reconcile().await;
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m2")))
        .await
        .unwrap();
    registry.fail_on(RegistryOp::ResolveJobOffer);

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_resolved, 0);
    assert_eq!(stats.failures, 1);
    assert_eq!(registry.get_job_target(&job).await.unwrap(), None);
    assert_locks_released(&registry, &job);
}

#[tokio::test]
async fn test_unreleased_lock_recovers_after_expiry() {
    let registry = MemoryRegistry::with_lock_ttl(Duration::from_millis(300));
    registry.register_machine(machine("m1"));
    registry.create_job(Job::new(name("web.service")));
    registry.set_job_target_state(&name("web.service"), JobState::Launched);
    let job = name("web.service");

    // The offer is published but the release fails; the lock is left behind.
    registry.fail_on(RegistryOp::Unlock);
    let engine = engine_for(&registry, "m1");
    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 1);
    assert!(registry.is_locked(&LockKey::Job(job.clone())));

    registry.clear_failures();
    registry
        .submit_bid(JobBid::new(job.clone(), mid("m1")))
        .await
        .unwrap();

    // A peer cannot take the job lock until it expires.
    assert!(registry.lock_job(&job, &mid("m2")).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(400)).await;
    let reclaimed = registry.lock_job(&job, &mid("m2")).await.unwrap();
    assert!(reclaimed.is_some());
    if let Some(lock) = reclaimed {
        lock.unlock().await.unwrap();
    }

    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_resolved, 1);
}

// =============================================================================
// Eligibility
// =============================================================================

#[tokio::test]
async fn test_unplaceable_job_stays_unscheduled() {
    let registry = MemoryRegistry::new();
    registry.register_machine(machine("m1"));
    let job = Job::new(name("huge.service")).with_resources(Resources::new(500, 4096));
    registry.create_job(job.clone());
    registry.set_job_target_state(&job.name, JobState::Launched);

    let engine = engine_for(&registry, "m1");
    let stats = engine.reconcile().await;
    assert_eq!(stats.offers_created, 0);
    assert_eq!(stats.failures, 1);
    assert!(registry.mutations().is_empty());
    assert_eq!(registry.get_job_target(&job.name).await.unwrap(), None);
    assert_locks_released(&registry, &job.name);
}

#[tokio::test]
async fn test_offer_excludes_machines_without_headroom() {
    let registry = MemoryRegistry::new();
    registry.register_machine(machine("m1"));
    registry.register_machine(machine("m2"));

    // db.service already runs on m1 and uses most of it.
    let db = Job::new(name("db.service"))
        .with_state(JobState::Launched)
        .with_resources(Resources::new(800, 800));
    registry.create_job(db.clone());
    registry.set_job_target_state(&db.name, JobState::Launched);
    registry.schedule_job(&db.name, &mid("m1")).await.unwrap();

    let web = Job::new(name("web.service")).with_resources(Resources::new(400, 400));
    registry.create_job(web.clone());
    registry.set_job_target_state(&web.name, JobState::Launched);

    engine_for(&registry, "m1").reconcile().await;

    let offers = registry.unresolved_job_offers().await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].machine_ids, vec![mid("m2")]);
}

#[tokio::test]
async fn test_offer_bounded_by_max_candidates() {
    let registry = seeded("web.service");
    registry.register_machine(machine("m3"));

    let engine = Engine::new(
        Arc::new(registry.clone()),
        machine("m1"),
        Cluster::new().with_max_candidates(NonZeroUsize::new(1)),
    );
    engine.reconcile().await;

    let offers = registry.unresolved_job_offers().await.unwrap();
    assert_eq!(offers[0].machine_ids, vec![mid("m1")]);
}
