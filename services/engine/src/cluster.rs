//! Cluster load model.
//!
//! A derived view of per-machine load, built from the registry's active
//! machines and current job placements. It only answers one question:
//! which machines may be offered a given job. It is a cache, never the
//! source of truth; the engine rebuilds it at the start of every pass.
//!
//! Eligibility is decided by a list of [`Constraint`]s. The defaults are
//! resource headroom, job conflicts and required machine metadata; more can
//! be plugged in with [`Cluster::with_constraint`].

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use flotilla_job::{Job, JobName, JobRequirements, MachineId, MachineState, Resources};
use thiserror::Error;
use tracing::debug;

/// Why a job could not be placed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// The model knows no machines at all.
    #[error("no machines known to the cluster")]
    NoMachines,

    /// Every known machine was rejected by some constraint.
    #[error("no eligible machine for job {job}: {} machine(s) rejected", .rejected.len())]
    NoEligibleMachines {
        job: JobName,
        rejected: Vec<Rejection>,
    },
}

/// A machine rejected during partitioning, and the constraint that rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub machine_id: MachineId,
    pub constraint: &'static str,
}

/// Tracked load of a single machine.
#[derive(Debug, Clone)]
pub struct MachineLoad {
    pub machine: MachineState,

    /// Resources reserved by jobs placed on this machine.
    pub used: Resources,

    /// Jobs placed on this machine.
    pub jobs: BTreeMap<JobName, JobRequirements>,
}

impl MachineLoad {
    fn new(machine: MachineState) -> Self {
        Self {
            machine,
            used: Resources::ZERO,
            jobs: BTreeMap::new(),
        }
    }

    /// Capacity not yet reserved.
    pub fn headroom(&self) -> Resources {
        self.machine.capacity.saturating_sub(&self.used)
    }

    pub fn id(&self) -> &MachineId {
        &self.machine.id
    }
}

/// A placement predicate.
pub trait Constraint: Send + Sync {
    /// Short name used in logs and rejections.
    fn name(&self) -> &'static str;

    /// Returns true if `load`'s machine may host `job`.
    fn admits(&self, job: &Job, load: &MachineLoad) -> bool;
}

/// The machine must have at least the job's resources free.
pub struct ResourceHeadroom;

impl Constraint for ResourceHeadroom {
    fn name(&self) -> &'static str {
        "resource_headroom"
    }

    fn admits(&self, job: &Job, load: &MachineLoad) -> bool {
        job.requirements.resources.fits_within(&load.headroom())
    }
}

/// The machine must not host a job that conflicts with this one, in either
/// direction.
pub struct NoConflicts;

impl Constraint for NoConflicts {
    fn name(&self) -> &'static str {
        "no_conflicts"
    }

    fn admits(&self, job: &Job, load: &MachineLoad) -> bool {
        load.jobs
            .iter()
            .filter(|(hosted, _)| **hosted != job.name)
            .all(|(hosted, reqs)| {
                !job.requirements.conflicts_with(hosted) && !reqs.conflicts_with(&job.name)
            })
    }
}

/// The machine must carry every metadata pair the job requires.
pub struct MetadataMatch;

impl Constraint for MetadataMatch {
    fn name(&self) -> &'static str {
        "machine_metadata"
    }

    fn admits(&self, job: &Job, load: &MachineLoad) -> bool {
        load.machine.has_metadata(&job.requirements.machine_metadata)
    }
}

/// Per-machine load view used to compute offer candidates.
pub struct Cluster {
    machines: BTreeMap<MachineId, MachineLoad>,
    placements: HashMap<JobName, MachineId>,
    constraints: Vec<Box<dyn Constraint>>,
    max_candidates: Option<NonZeroUsize>,
}

impl Cluster {
    /// Create an empty model with the default constraints.
    pub fn new() -> Self {
        Self {
            machines: BTreeMap::new(),
            placements: HashMap::new(),
            constraints: vec![
                Box::new(ResourceHeadroom),
                Box::new(NoConflicts),
                Box::new(MetadataMatch),
            ],
            max_candidates: None,
        }
    }

    /// Add a placement predicate.
    pub fn with_constraint(mut self, constraint: Box<dyn Constraint>) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Bound the number of candidates returned by [`Cluster::partition`].
    /// The bound is never zero, so a successful partition names at least one
    /// machine.
    pub fn with_max_candidates(mut self, max: Option<NonZeroUsize>) -> Self {
        self.max_candidates = max;
        self
    }

    /// Replace the view with fresh registry state.
    ///
    /// Placements on machines that are not active are ignored.
    pub fn rebuild<'a>(
        &mut self,
        machines: Vec<MachineState>,
        placements: impl IntoIterator<Item = (&'a Job, &'a MachineId)>,
    ) {
        self.machines = machines
            .into_iter()
            .map(|m| (m.id.clone(), MachineLoad::new(m)))
            .collect();
        self.placements.clear();

        for (job, machine) in placements {
            self.track_job(job, machine);
        }

        debug!(
            machines = self.machines.len(),
            placements = self.placements.len(),
            "Rebuilt cluster load model"
        );
    }

    /// Record that `job` is placed on `machine`.
    pub fn track_job(&mut self, job: &Job, machine: &MachineId) {
        self.untrack_job(&job.name);

        let Some(load) = self.machines.get_mut(machine) else {
            debug!(job = %job.name, machine_id = %machine, "Ignoring placement on unknown machine");
            return;
        };

        load.used = load.used.saturating_add(&job.requirements.resources);
        load.jobs
            .insert(job.name.clone(), job.requirements.clone());
        self.placements.insert(job.name.clone(), machine.clone());
    }

    /// Forget a job's placement.
    pub fn untrack_job(&mut self, name: &JobName) {
        let Some(machine) = self.placements.remove(name) else {
            return;
        };

        if let Some(load) = self.machines.get_mut(&machine) {
            if let Some(reqs) = load.jobs.remove(name) {
                load.used = load.used.saturating_sub(&reqs.resources);
            }
        }
    }

    /// Load of one machine, if known.
    pub fn load(&self, machine: &MachineId) -> Option<&MachineLoad> {
        self.machines.get(machine)
    }

    /// Machine a job is placed on, if known.
    pub fn placement(&self, name: &JobName) -> Option<&MachineId> {
        self.placements.get(name)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Machines eligible to host `job`, best candidate first.
    ///
    /// Candidates are ordered by free memory, then free CPU (both
    /// descending), then machine ID. Never empty on success.
    pub fn partition(&self, job: &Job) -> Result<Vec<MachineId>, PlacementError> {
        if self.machines.is_empty() {
            return Err(PlacementError::NoMachines);
        }

        let mut eligible: Vec<&MachineLoad> = Vec::new();
        let mut rejected = Vec::new();

        for load in self.machines.values() {
            match self.constraints.iter().find(|c| !c.admits(job, load)) {
                Some(constraint) => rejected.push(Rejection {
                    machine_id: load.id().clone(),
                    constraint: constraint.name(),
                }),
                None => eligible.push(load),
            }
        }

        if eligible.is_empty() {
            return Err(PlacementError::NoEligibleMachines {
                job: job.name.clone(),
                rejected,
            });
        }

        eligible.sort_by(|a, b| {
            let (ha, hb) = (a.headroom(), b.headroom());
            hb.memory_mb
                .cmp(&ha.memory_mb)
                .then(hb.cpu_millis.cmp(&ha.cpu_millis))
                .then_with(|| a.id().cmp(b.id()))
        });

        let limit = self.max_candidates.map_or(usize::MAX, NonZeroUsize::get);
        Ok(eligible
            .into_iter()
            .take(limit)
            .map(|load| load.id().clone())
            .collect())
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(s: &str) -> MachineId {
        MachineId::parse(s).unwrap()
    }

    fn job(s: &str, cpu: u64, mem: u64) -> Job {
        Job::new(JobName::parse(s).unwrap()).with_resources(Resources::new(cpu, mem))
    }

    fn machine(s: &str, cpu: u64, mem: u64) -> MachineState {
        MachineState::new(id(s), Resources::new(cpu, mem))
    }

    fn ids(list: &[MachineId]) -> Vec<&str> {
        list.iter().map(|m| m.as_str()).collect()
    }

    #[test]
    fn test_empty_cluster() {
        let cluster = Cluster::new();
        assert_eq!(
            cluster.partition(&job("web.service", 0, 0)),
            Err(PlacementError::NoMachines)
        );
    }

    #[rstest]
    #[case(100, 128, vec!["m2", "m1"])]
    #[case(600, 128, vec!["m2"])]
    #[case(100, 900, vec!["m2"])]
    #[case(2000, 128, vec![])]
    fn test_partition_respects_headroom(
        #[case] cpu: u64,
        #[case] mem: u64,
        #[case] expected: Vec<&str>,
    ) {
        let mut cluster = Cluster::new();
        let placed = job("db.service", 500, 512);
        let m1 = id("m1");
        cluster.rebuild(
            vec![machine("m1", 1000, 1024), machine("m2", 1000, 1024)],
            [(&placed, &m1)],
        );

        let result = cluster.partition(&job("web.service", cpu, mem));
        if expected.is_empty() {
            assert!(matches!(
                result,
                Err(PlacementError::NoEligibleMachines { .. })
            ));
        } else {
            assert_eq!(ids(&result.unwrap()), expected);
        }
    }

    #[test]
    fn test_partition_never_returns_machine_without_headroom() {
        let mut cluster = Cluster::new();
        let big = job("big.service", 900, 900);
        let m1 = id("m1");
        cluster.rebuild(
            vec![
                machine("m1", 1000, 1000),
                machine("m2", 1000, 1000),
                machine("m3", 200, 200),
            ],
            [(&big, &m1)],
        );

        let want = job("web.service", 300, 300);
        let picked = cluster.partition(&want).unwrap();
        assert_eq!(ids(&picked), vec!["m2"]);
        for m in &picked {
            let load = cluster.load(m).unwrap();
            assert!(want.requirements.resources.fits_within(&load.headroom()));
        }
    }

    #[test]
    fn test_rejections_name_constraint() {
        let mut cluster = Cluster::new();
        cluster.rebuild(vec![machine("m1", 100, 100)], std::iter::empty());

        let err = cluster.partition(&job("web.service", 200, 50)).unwrap_err();
        assert_eq!(
            err,
            PlacementError::NoEligibleMachines {
                job: JobName::parse("web.service").unwrap(),
                rejected: vec![Rejection {
                    machine_id: id("m1"),
                    constraint: "resource_headroom",
                }],
            }
        );
        assert!(err.to_string().contains("1 machine(s) rejected"));
    }

    #[test]
    fn test_conflicts_are_symmetric() {
        let mut cluster = Cluster::new();
        let hosted = job("web.1.service", 0, 0).with_conflict("web.*");
        let m1 = id("m1");
        cluster.rebuild(
            vec![machine("m1", 1000, 1000), machine("m2", 1000, 1000)],
            [(&hosted, &m1)],
        );

        // The newcomer declares nothing, but the hosted job does.
        let plain = job("web.2.service", 0, 0);
        assert_eq!(ids(&cluster.partition(&plain).unwrap()), vec!["m2"]);

        // And the other way round.
        let declaring = job("api.service", 0, 0).with_conflict("web.1.service");
        assert_eq!(ids(&cluster.partition(&declaring).unwrap()), vec!["m2"]);

        let unrelated = job("db.service", 0, 0);
        assert_eq!(cluster.partition(&unrelated).unwrap().len(), 2);
    }

    #[test]
    fn test_metadata_constraint() {
        let mut cluster = Cluster::new();
        cluster.rebuild(
            vec![
                machine("m1", 1000, 1000).with_metadata("region", "eu"),
                machine("m2", 1000, 1000).with_metadata("region", "us"),
            ],
            std::iter::empty(),
        );

        let want = job("web.service", 0, 0).with_machine_metadata("region", "us");
        assert_eq!(ids(&cluster.partition(&want).unwrap()), vec!["m2"]);
    }

    #[test]
    fn test_candidates_bounded_and_ordered() {
        let mut cluster = Cluster::new().with_max_candidates(NonZeroUsize::new(2));
        cluster.rebuild(
            vec![
                machine("m1", 1000, 512),
                machine("m2", 1000, 2048),
                machine("m3", 2000, 1024),
                machine("m4", 1000, 1024),
            ],
            std::iter::empty(),
        );

        let picked = cluster.partition(&job("web.service", 0, 0)).unwrap();
        assert_eq!(ids(&picked), vec!["m2", "m3"]);
    }

    #[test]
    fn test_track_and_untrack() {
        let mut cluster = Cluster::new();
        cluster.rebuild(vec![machine("m1", 1000, 1000)], std::iter::empty());

        let web = job("web.service", 400, 400);
        cluster.track_job(&web, &id("m1"));
        assert_eq!(cluster.load(&id("m1")).unwrap().headroom(), Resources::new(600, 600));
        assert_eq!(cluster.placement(&web.name), Some(&id("m1")));

        // Tracking again does not double count.
        cluster.track_job(&web, &id("m1"));
        assert_eq!(cluster.load(&id("m1")).unwrap().used, Resources::new(400, 400));

        cluster.untrack_job(&web.name);
        assert_eq!(cluster.load(&id("m1")).unwrap().used, Resources::ZERO);
        assert_eq!(cluster.placement(&web.name), None);
    }

    struct DenyAll;

    impl Constraint for DenyAll {
        fn name(&self) -> &'static str {
            "deny_all"
        }

        fn admits(&self, _job: &Job, _load: &MachineLoad) -> bool {
            false
        }
    }

    #[test]
    fn test_pluggable_constraint() {
        let mut cluster = Cluster::new().with_constraint(Box::new(DenyAll));
        cluster.rebuild(vec![machine("m1", 1000, 1000)], std::iter::empty());

        match cluster.partition(&job("web.service", 0, 0)) {
            Err(PlacementError::NoEligibleMachines { rejected, .. }) => {
                assert_eq!(rejected[0].constraint, "deny_all");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
