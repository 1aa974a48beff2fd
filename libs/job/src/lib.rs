//! # flotilla-job
//!
//! Data model shared by the registry contract and the engine.
//!
//! - [`Job`]: a unit of work with an observed state and placement requirements
//! - [`JobOffer`]: a job published for bidding among eligible machines
//! - [`JobBid`]: a machine's claim to run an offered job
//! - [`MachineState`]: a machine's identity, capacity and metadata

mod job;
mod machine;
mod offer;
mod resources;

pub use job::{Job, JobRequirements, JobState, ParseJobStateError};
pub use machine::MachineState;
pub use offer::{JobBid, JobOffer};
pub use resources::Resources;

pub use flotilla_id::{JobName, MachineId};
