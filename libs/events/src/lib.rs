//! # flotilla-events
//!
//! Event definitions for the flotilla scheduling core.
//!
//! ## Design Principles
//!
//! - Events are notifications, not state: a consumer that receives one is
//!   expected to re-read the registry rather than apply the payload
//! - Every event names exactly one subject (a job, offer, machine or unit)
//! - Only unit-state events carry a payload
//!
//! ## Event Sources
//!
//! - Registry change stream (`job.*`, `job_offer.*`, `job_bid.*`, `machine.*`)
//! - Local unit-state stream (`unit.state_updated`)

mod error;
mod event;
mod types;
mod unit;

pub use error::EventError;
pub use event::Event;
pub use types::*;
pub use unit::{translate_unit_status_events, UnitState, UnitStatus};
