//! flotilla scheduling engine.
//!
//! A leaderless scheduler: every machine runs an identical engine against a
//! shared registry, and registry locks keep concurrent engines from acting
//! on the same job twice.
//!
//! ## Architecture
//!
//! - **Registry**: shared store contract, with an in-memory implementation
//! - **Cluster**: per-machine load view used to pick offer candidates
//! - **Engine**: offer / resolve / unschedule steps and the reconciliation pass
//! - **Bus**: fans events from the registry and unit streams out to listeners
//! - **Worker**: runs one reconciliation pass per (coalesced) wake

pub mod bus;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod registry;
pub mod unit_stream;
pub mod worker;

pub use cluster::{Cluster, Constraint, PlacementError};
pub use engine::{Engine, EngineError, ReconcileStats, StepOutcome};
pub use registry::{MemoryRegistry, Registry, RegistryError, RegistryEventStream};
pub use worker::EngineWorker;
