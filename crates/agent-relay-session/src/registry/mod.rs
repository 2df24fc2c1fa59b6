//! Agent registry implementations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryRegistry;

/// Capacity and idle limits for a registry. The default never evicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Maximum number of agents kept.
    pub max_agents: Option<usize>,
    /// Idle time after which an agent may be evicted.
    pub idle_ttl: Option<Duration>,
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
