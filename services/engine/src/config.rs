//! Configuration for the engine.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flotilla_job::{MachineId, MachineState, Resources};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity this engine takes locks under.
    pub machine_id: MachineId,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// TTL of registry locks.
    pub lock_ttl: Duration,

    /// Upper bound on machines named in one offer. `None` is unbounded.
    pub max_offer_candidates: Option<NonZeroUsize>,

    /// Capacity of the event bus channel.
    pub event_buffer: usize,

    /// Capacity of the local machine.
    pub capacity: Resources,

    /// Metadata advertised by the local machine.
    pub machine_metadata: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let machine_id = match lookup("FLOTILLA_MACHINE_ID") {
            Some(s) => MachineId::parse(&s).context("invalid FLOTILLA_MACHINE_ID")?,
            None => MachineId::generate(),
        };

        let log_level = lookup("FLOTILLA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let lock_ttl_secs: u64 = parse_var(&lookup, "FLOTILLA_LOCK_TTL_SECS")?.unwrap_or(10);
        if lock_ttl_secs == 0 {
            return Err(anyhow!("FLOTILLA_LOCK_TTL_SECS must be positive"));
        }

        let max_offer_candidates = parse_var(&lookup, "FLOTILLA_MAX_OFFER_CANDIDATES")?;
        let event_buffer = parse_var(&lookup, "FLOTILLA_EVENT_BUFFER")?.unwrap_or(256);
        if event_buffer == 0 {
            return Err(anyhow!("FLOTILLA_EVENT_BUFFER must be positive"));
        }
        let cpu_millis = parse_var(&lookup, "FLOTILLA_CPU_MILLIS")?.unwrap_or(1000);
        let memory_mb = parse_var(&lookup, "FLOTILLA_MEMORY_MB")?.unwrap_or(1024);

        let machine_metadata = match lookup("FLOTILLA_MACHINE_METADATA") {
            Some(raw) => parse_metadata(&raw).context("invalid FLOTILLA_MACHINE_METADATA")?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            machine_id,
            log_level,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            max_offer_candidates,
            event_buffer,
            capacity: Resources::new(cpu_millis, memory_mb),
            machine_metadata,
        })
    }

    /// The local machine as it is advertised to the registry.
    pub fn local_machine(&self) -> MachineState {
        let mut machine = MachineState::new(self.machine_id.clone(), self.capacity);
        machine.metadata = self.machine_metadata.clone();
        machine
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}

/// Parses `key=value,key=value`. Empty segments are ignored.
fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected key=value, got {pair:?}"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("empty key in {pair:?}"));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
