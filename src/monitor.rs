//! Memory-pressure guard.
//!
//! Before the expensive vision step of each point the scan loop asks the guard
//! whether resident memory is above the configured ceiling. Above it, the
//! point is positioned on planned coordinates only and the matcher caches are
//! dropped.

use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of the process resident set size.
pub trait MemorySampler: Send + Sync {
    /// Resident memory in bytes, or `None` if it cannot be read.
    fn resident_bytes(&self) -> Option<u64>;
}

impl<T: MemorySampler + ?Sized> MemorySampler for std::sync::Arc<T> {
    fn resident_bytes(&self) -> Option<u64> {
        (**self).resident_bytes()
    }
}

/// Samples this process through `sysinfo`.
#[derive(Debug)]
pub struct SysinfoSampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoSampler {
    /// Sampler for the current process.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = e, "Cannot resolve own pid; memory guard disabled"))
            .ok();
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }
}

/// Sampler returning a settable value; for tests and simulation.
#[derive(Debug, Default)]
pub struct FixedSampler {
    bytes: std::sync::atomic::AtomicU64,
}

impl FixedSampler {
    /// Sampler reporting `mb` megabytes.
    pub fn from_mb(mb: u64) -> Self {
        Self {
            bytes: std::sync::atomic::AtomicU64::new(mb * BYTES_PER_MB),
        }
    }

    /// Change the reported value.
    pub fn set_mb(&self, mb: u64) {
        self.bytes
            .store(mb * BYTES_PER_MB, std::sync::atomic::Ordering::Relaxed);
    }
}

impl MemorySampler for FixedSampler {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(std::sync::atomic::Ordering::Relaxed))
    }
}

/// Result of one memory check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Below the ceiling
    Normal {
        /// Resident megabytes
        resident_mb: u64,
    },
    /// Above the ceiling; skip the expensive path
    Exceeded {
        /// Resident megabytes
        resident_mb: u64,
    },
    /// Sampling failed; treated as normal
    Unknown,
}

impl MemoryPressure {
    /// Whether the expensive path should be skipped.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, MemoryPressure::Exceeded { .. })
    }
}

/// Compares resident memory against a ceiling.
pub struct MemoryGuard {
    sampler: Box<dyn MemorySampler>,
    ceiling_mb: u64,
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("ceiling_mb", &self.ceiling_mb)
            .finish_non_exhaustive()
    }
}

impl MemoryGuard {
    /// Guard over `sampler` with a ceiling in megabytes.
    pub fn new(sampler: Box<dyn MemorySampler>, ceiling_mb: u64) -> Self {
        Self {
            sampler,
            ceiling_mb,
        }
    }

    /// Guard sampling this process.
    pub fn for_current_process(ceiling_mb: u64) -> Self {
        Self::new(Box::new(SysinfoSampler::new()), ceiling_mb)
    }

    /// Configured ceiling.
    pub fn ceiling_mb(&self) -> u64 {
        self.ceiling_mb
    }

    /// Sample once and classify.
    pub fn check(&self) -> MemoryPressure {
        match self.sampler.resident_bytes() {
            Some(bytes) => {
                let resident_mb = bytes / BYTES_PER_MB;
                if bytes > self.ceiling_mb.saturating_mul(BYTES_PER_MB) {
                    MemoryPressure::Exceeded { resident_mb }
                } else {
                    MemoryPressure::Normal { resident_mb }
                }
            }
            None => {
                debug!("Memory sample unavailable");
                MemoryPressure::Unknown
            }
        }
    }
}
