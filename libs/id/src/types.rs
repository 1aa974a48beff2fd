//! Typed name definitions for scheduling resources.

use crate::define_name;

pub use crate::macros::{validate_name, MAX_NAME_LEN};

// =============================================================================
// Jobs and Machines
// =============================================================================

define_name!(JobName, "job name");
define_name!(MachineId, "machine id");

impl MachineId {
    /// Prefix used for generated machine IDs.
    pub const GENERATED_PREFIX: &'static str = "mach";

    /// Generates a fresh, time-sortable machine ID (`mach_<ulid>`).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{}_{}", Self::GENERATED_PREFIX, crate::Ulid::new()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_job_name_roundtrip() {
        let name: JobName = "web.service".parse().unwrap();
        assert_eq!(name.as_str(), "web.service");
        assert_eq!(name.to_string(), "web.service");
    }

    #[test]
    fn test_job_name_empty() {
        let result: Result<JobName, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_job_name_rejects_slash() {
        let result: Result<JobName, _> = "a/b.service".parse();
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidChar {
                kind: "job name",
                ch: '/'
            }
        );
    }

    #[test]
    fn test_machine_id_rejects_whitespace() {
        let result: Result<MachineId, _> = "m 1".parse();
        assert!(matches!(result, Err(IdError::InvalidChar { ch: ' ', .. })));
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let result = JobName::parse(&long);
        assert!(matches!(result, Err(IdError::TooLong { len: 256, .. })));
    }

    #[test]
    fn test_generated_machine_id() {
        let id = MachineId::generate();
        assert!(id.as_str().starts_with("mach_"));
        assert!(MachineId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_generated_machine_ids_sortable() {
        let id1 = MachineId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = MachineId::generate();
        assert!(id1 < id2);
    }

    #[test]
    fn test_json_roundtrip_validates() {
        let name: JobName = "db.service".parse().unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"db.service\"");
        let parsed: JobName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);

        let bad: Result<JobName, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_names_parse(s in "[a-zA-Z0-9@._-]{1,64}") {
            let name = JobName::parse(&s).unwrap();
            prop_assert_eq!(name.as_str(), s.as_str());
        }

        #[test]
        fn prop_names_with_slash_rejected(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
            let s = format!("{a}/{b}");
            prop_assert!(MachineId::parse(&s).is_err());
        }
    }
}
