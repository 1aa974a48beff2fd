//! In-memory registry.
//!
//! Implements the registry contract in-process with the same observable
//! semantics the engine relies on from a real store: linearizable
//! operations, compare-and-swap style preconditions, and locks that expire
//! after a TTL. Used by tests and by the development binary.
//!
//! Besides the contract it offers seeding helpers (jobs, target states,
//! machines), failure injection, and introspection of the mutations and
//! lock traffic it has seen.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_events::{Event, EventKind};
use flotilla_job::{Job, JobBid, JobName, JobOffer, JobState, MachineId, MachineState};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use super::{
    LockKey, Registry, RegistryError, RegistryEventStream, RegistryLock, RegistryOp,
    RegistryResult,
};

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Capacity of the change broadcast channel.
const CHANGE_BUFFER: usize = 1024;

/// Events and mutations retained for replay and introspection. Older
/// entries are dropped.
pub const LOG_CAPACITY: usize = 4096;

/// A write made through the registry contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateJobOffer(JobName),
    ResolveJobOffer(JobName),
    ScheduleJob(JobName, MachineId),
    ClearJobTarget(JobName, MachineId),
    SubmitBid(JobBid),
}

struct OfferRecord {
    offer: JobOffer,
    resolved: bool,
}

struct LockRecord {
    owner: MachineId,
    token: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobName, Job>,
    target_states: HashMap<JobName, JobState>,
    targets: HashMap<JobName, MachineId>,
    offers: BTreeMap<JobName, OfferRecord>,
    bids: HashMap<JobName, Vec<JobBid>>,
    machines: BTreeMap<MachineId, MachineState>,

    locks: HashMap<LockKey, LockRecord>,
    next_token: u64,
    acquisitions: HashMap<LockKey, usize>,
    unlocks: HashMap<LockKey, usize>,

    failures: HashSet<RegistryOp>,
    mutations: VecDeque<Mutation>,

    /// Retained tail of the change log; `events[0]` has index `events_base`.
    events: VecDeque<Event>,
    events_base: u64,
}

impl Inner {
    fn record(&mut self, mutation: Mutation) {
        if self.mutations.len() == LOG_CAPACITY {
            self.mutations.pop_front();
        }
        self.mutations.push_back(mutation);
    }

    fn check(&self, op: RegistryOp) -> RegistryResult<()> {
        if self.failures.contains(&op) {
            return Err(RegistryError::Injected(op));
        }
        Ok(())
    }
}

struct Shared {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<(u64, Event)>,
    lock_ttl: chrono::Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event to the log and fan it out to live streams.
    fn publish(&self, inner: &mut Inner, event: Event) {
        let index = inner.events_base + inner.events.len() as u64;
        inner.events.push_back(event.clone());
        if inner.events.len() > LOG_CAPACITY {
            inner.events.pop_front();
            inner.events_base += 1;
        }
        // No receivers is fine; streams replay from the log.
        let _ = self.changes.send((index, event));
    }
}

/// Registry held entirely in memory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl MemoryRegistry {
    /// Create an empty registry with the default lock TTL.
    pub fn new() -> Self {
        Self::with_lock_ttl(DEFAULT_LOCK_TTL)
    }

    /// Create an empty registry whose locks expire after `ttl`.
    pub fn with_lock_ttl(ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let lock_ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                changes,
                lock_ttl,
            }),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Submit a job (or replace its definition).
    pub fn create_job(&self, job: Job) {
        let mut guard = self.shared.lock();
        let name = job.name.clone();
        guard.jobs.insert(name.clone(), job);
        self.shared
            .publish(&mut guard, Event::new(EventKind::JobCreated, name.as_str()));
    }

    /// Set the desired state of a job.
    pub fn set_job_target_state(&self, name: &JobName, state: JobState) {
        let mut guard = self.shared.lock();
        guard.target_states.insert(name.clone(), state);
        self.shared.publish(
            &mut guard,
            Event::new(EventKind::JobTargetStateChanged, name.as_str()),
        );
    }

    /// Record the observed state of a job, as an agent would.
    pub fn set_job_state(&self, name: &JobName, state: Option<JobState>) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let job = guard
            .jobs
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(format!("job {}", name)))?;
        job.state = state;
        self.shared.publish(
            &mut guard,
            Event::new(EventKind::JobStateUpdated, name.as_str()),
        );
        Ok(())
    }

    /// Register (or update) a machine.
    pub fn register_machine(&self, machine: MachineState) {
        let mut guard = self.shared.lock();
        let id = machine.id.clone();
        guard.machines.insert(id.clone(), machine);
        self.shared
            .publish(&mut guard, Event::new(EventKind::MachineUpdated, id.as_str()));
    }

    /// Remove a machine from the active set.
    pub fn remove_machine(&self, id: &MachineId) {
        let mut guard = self.shared.lock();
        if guard.machines.remove(id).is_some() {
            self.shared
                .publish(&mut guard, Event::new(EventKind::MachineUpdated, id.as_str()));
        }
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: RegistryOp) {
        self.shared.lock().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.shared.lock().failures.clear();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The most recent writes made through the registry contract (at most
    /// [`LOG_CAPACITY`]), oldest first.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.shared.lock().mutations.iter().cloned().collect()
    }

    /// Number of times `key` has been acquired.
    pub fn lock_acquisitions(&self, key: &LockKey) -> usize {
        self.shared.lock().acquisitions.get(key).copied().unwrap_or(0)
    }

    /// Number of times a handle for `key` has been unlocked.
    pub fn unlock_count(&self, key: &LockKey) -> usize {
        self.shared.lock().unlocks.get(key).copied().unwrap_or(0)
    }

    /// Returns true if `key` is held and has not expired.
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.shared
            .lock()
            .locks
            .get(key)
            .is_some_and(|record| record.expires_at > Utc::now())
    }

    /// Resolution status of the latest offer for a job, if any.
    pub fn offer_resolved(&self, name: &JobName) -> Option<bool> {
        self.shared.lock().offers.get(name).map(|r| r.resolved)
    }

    /// Number of events published so far, including ones no longer retained.
    pub fn event_count(&self) -> u64 {
        let guard = self.shared.lock();
        guard.events_base + guard.events.len() as u64
    }

    // =========================================================================
    // Locks
    // =========================================================================

    fn acquire(
        &self,
        op: RegistryOp,
        key: LockKey,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(op)?;

        let now = Utc::now();
        if let Some(existing) = inner.locks.get(&key) {
            if existing.expires_at > now {
                debug!(lock = %key, holder = %existing.owner, "Lock is held");
                return Ok(None);
            }
            debug!(lock = %key, previous_holder = %existing.owner, "Reclaiming expired lock");
        }

        inner.next_token += 1;
        let token = inner.next_token;
        inner.locks.insert(
            key.clone(),
            LockRecord {
                owner: owner.clone(),
                token,
                expires_at: now + self.shared.lock_ttl,
            },
        );
        *inner.acquisitions.entry(key.clone()).or_default() += 1;

        Ok(Some(Box::new(MemoryLock {
            key,
            owner: owner.clone(),
            token,
            shared: Arc::clone(&self.shared),
        })))
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock handle returned by [`MemoryRegistry`].
struct MemoryLock {
    key: LockKey,
    owner: MachineId,
    token: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl RegistryLock for MemoryLock {
    fn key(&self) -> &LockKey {
        &self.key
    }

    fn owner(&self) -> &MachineId {
        &self.owner
    }

    async fn unlock(self: Box<Self>) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        *inner.unlocks.entry(self.key.clone()).or_default() += 1;
        inner.check(RegistryOp::Unlock)?;

        match inner.locks.get(&self.key) {
            Some(record) if record.token == self.token => {
                inner.locks.remove(&self.key);
                Ok(())
            }
            _ => Err(RegistryError::Conflict(format!(
                "lock {} no longer held by {}",
                self.key, self.owner
            ))),
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn unresolved_job_offers(&self) -> RegistryResult<Vec<JobOffer>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::UnresolvedJobOffers)?;
        Ok(guard
            .offers
            .values()
            .filter(|r| !r.resolved)
            .map(|r| r.offer.clone())
            .collect())
    }

    async fn bids(&self, offer: &JobOffer) -> RegistryResult<Vec<JobBid>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::Bids)?;
        let name = offer.job_name();
        let open = guard.offers.get(name).is_some_and(|r| !r.resolved);
        if !open {
            return Ok(Vec::new());
        }
        Ok(guard.bids.get(name).cloned().unwrap_or_default())
    }

    async fn get_all_jobs(&self) -> RegistryResult<Vec<Job>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::GetAllJobs)?;
        Ok(guard.jobs.values().cloned().collect())
    }

    async fn get_job_target_state(&self, name: &JobName) -> RegistryResult<Option<JobState>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::GetJobTargetState)?;
        Ok(guard.target_states.get(name).copied())
    }

    async fn get_job_target(&self, name: &JobName) -> RegistryResult<Option<MachineId>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::GetJobTarget)?;
        Ok(guard.targets.get(name).cloned())
    }

    async fn clear_job_target(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(RegistryOp::ClearJobTarget)?;

        match inner.targets.get(name) {
            Some(current) if current == machine => {
                inner.targets.remove(name);
            }
            Some(current) => {
                return Err(RegistryError::Conflict(format!(
                    "job {} is targeted at {}, not {}",
                    name, current, machine
                )));
            }
            None => return Err(RegistryError::NotFound(format!("target of job {}", name))),
        }

        inner.record(Mutation::ClearJobTarget(name.clone(), machine.clone()));
        self.shared
            .publish(inner, Event::new(EventKind::JobUnscheduled, name.as_str()));
        Ok(())
    }

    async fn create_job_offer(&self, offer: JobOffer) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(RegistryOp::CreateJobOffer)?;

        let name = offer.job_name().clone();
        if inner.offers.get(&name).is_some_and(|r| !r.resolved) {
            return Err(RegistryError::Conflict(format!(
                "unresolved offer for job {} already exists",
                name
            )));
        }
        if let Some(target) = inner.targets.get(&name) {
            return Err(RegistryError::Conflict(format!(
                "job {} is already scheduled to {}",
                name, target
            )));
        }

        inner.bids.remove(&name);
        inner.offers.insert(
            name.clone(),
            OfferRecord {
                offer,
                resolved: false,
            },
        );
        inner.record(Mutation::CreateJobOffer(name.clone()));
        self.shared
            .publish(inner, Event::new(EventKind::JobOfferCreated, name.as_str()));
        Ok(())
    }

    async fn resolve_job_offer(&self, name: &JobName) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(RegistryOp::ResolveJobOffer)?;

        match inner.offers.get_mut(name) {
            Some(record) if !record.resolved => record.resolved = true,
            _ => {
                return Err(RegistryError::NotFound(format!(
                    "unresolved offer for job {}",
                    name
                )))
            }
        }

        inner.bids.remove(name);
        inner.record(Mutation::ResolveJobOffer(name.clone()));
        self.shared
            .publish(inner, Event::new(EventKind::JobOfferResolved, name.as_str()));
        Ok(())
    }

    async fn schedule_job(&self, name: &JobName, machine: &MachineId) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(RegistryOp::ScheduleJob)?;

        if !inner.jobs.contains_key(name) {
            return Err(RegistryError::NotFound(format!("job {}", name)));
        }

        inner.targets.insert(name.clone(), machine.clone());
        inner.record(Mutation::ScheduleJob(name.clone(), machine.clone()));
        self.shared
            .publish(inner, Event::new(EventKind::JobScheduled, name.as_str()));
        Ok(())
    }

    async fn lock_job(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>> {
        self.acquire(RegistryOp::LockJob, LockKey::Job(name.clone()), owner)
    }

    async fn lock_job_offer(
        &self,
        name: &JobName,
        owner: &MachineId,
    ) -> RegistryResult<Option<Box<dyn RegistryLock>>> {
        self.acquire(
            RegistryOp::LockJobOffer,
            LockKey::JobOffer(name.clone()),
            owner,
        )
    }

    async fn get_active_machines(&self) -> RegistryResult<Vec<MachineState>> {
        let guard = self.shared.lock();
        guard.check(RegistryOp::GetActiveMachines)?;
        Ok(guard.machines.values().cloned().collect())
    }

    async fn submit_bid(&self, bid: JobBid) -> RegistryResult<()> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.check(RegistryOp::SubmitBid)?;

        let record = match inner.offers.get(&bid.job_name) {
            Some(record) if !record.resolved => record,
            _ => {
                return Err(RegistryError::NotFound(format!(
                    "unresolved offer for job {}",
                    bid.job_name
                )))
            }
        };
        if !record.offer.is_candidate(&bid.machine_id) {
            return Err(RegistryError::Conflict(format!(
                "machine {} was not offered job {}",
                bid.machine_id, bid.job_name
            )));
        }

        let bids = inner.bids.entry(bid.job_name.clone()).or_default();
        if bids.iter().any(|b| b.machine_id == bid.machine_id) {
            return Ok(());
        }
        bids.push(bid.clone());

        let subject = bid.job_name.to_string();
        inner.record(Mutation::SubmitBid(bid));
        self.shared
            .publish(inner, Event::new(EventKind::JobBidSubmitted, subject));
        Ok(())
    }
}

#[async_trait]
impl RegistryEventStream for MemoryRegistry {
    async fn stream(
        &self,
        from_index: u64,
        sink: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Subscribe before reading the backlog so nothing falls in between;
        // duplicates are filtered by index.
        let mut changes = self.shared.changes.subscribe();
        let mut next = from_index;

        for (index, event) in self.backlog(next) {
            if sink.send(event).await.is_err() {
                return;
            }
            next = index + 1;
        }

        debug!(from_index, replayed_to = next, "Registry stream caught up");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                received = changes.recv() => match received {
                    Ok((index, event)) => {
                        if index < next {
                            continue;
                        }
                        next = index + 1;
                        if sink.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, next, "Registry stream lagged, replaying from log");
                        for (index, event) in self.backlog(next) {
                            if sink.send(event).await.is_err() {
                                return;
                            }
                            next = index + 1;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(next, "Registry stream stopped");
    }
}

impl MemoryRegistry {
    /// Retained events from `from_index` on, with their indexes. Events
    /// older than the retained tail are skipped.
    fn backlog(&self, from_index: u64) -> Vec<(u64, Event)> {
        let guard = self.shared.lock();
        let start = from_index.max(guard.events_base);
        let skip = usize::try_from(start - guard.events_base).unwrap_or(usize::MAX);
        if start > from_index {
            warn!(from_index, oldest = start, "Change log no longer holds requested events");
        }
        guard
            .events
            .iter()
            .skip(skip)
            .cloned()
            .enumerate()
            .map(|(offset, event)| (start + offset as u64, event))
            .collect()
    }
}
