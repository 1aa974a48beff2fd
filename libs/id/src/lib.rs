//! # flotilla-id
//!
//! Validated identifier types for the flotilla scheduling core.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels; they double as registry keys
//! - Every name has a canonical string form with strict parsing
//! - Names are typed so a job name can never be passed where a machine ID is
//!   expected
//!
//! ## Name Format
//!
//! Names are 1..=255 bytes of printable, non-whitespace characters and may
//! not contain `/` (the registry uses it as a key separator).
//!
//! Examples:
//! - `web.service`
//! - `m1`
//! - `mach_01HV4Z2WQXKJNM8GPQY6VBKC3D` (generated machine ID)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
