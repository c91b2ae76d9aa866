use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use regflow_core::MB;
use sysinfo::System;

/// One raw reading of memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Source of memory readings for [`crate::MemoryMonitor`].
pub trait MemorySampler: Send + Sync + fmt::Debug {
    fn sample(&self) -> MemorySample;
}

/// Samples the running process against either a fixed budget or the host's total memory.
///
/// Usage is the process RSS when it can be read, falling back to host-wide used memory.
pub struct SystemMemorySampler {
    budget_bytes: Option<u64>,
    system: Mutex<System>,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        Self {
            budget_bytes: None,
            system: Mutex::new(System::new()),
        }
    }

    /// Treat `budget_bytes` as the total capacity instead of the host's memory.
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: Some(budget_bytes),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemorySampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemorySampler")
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();
        system.refresh_memory();

        let host_total = system.total_memory();
        let host_available = system.available_memory();
        let used = current_rss_bytes().unwrap_or_else(|| system.used_memory());

        match self.budget_bytes {
            Some(budget) => MemorySample {
                used_bytes: used,
                available_bytes: budget.saturating_sub(used).min(host_available),
                total_bytes: budget,
            },
            None => MemorySample {
                used_bytes: used,
                available_bytes: host_available,
                total_bytes: host_total,
            },
        }
    }
}

/// Deterministic sampler driven by the caller.
#[derive(Debug, Clone)]
pub struct ManualMemorySampler {
    used_bytes: Arc<AtomicU64>,
    total_bytes: u64,
}

impl ManualMemorySampler {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            used_bytes: Arc::new(AtomicU64::new(0)),
            total_bytes,
        }
    }

    pub fn with_total_mb(total_mb: f64) -> Self {
        Self::new(mb_to_bytes(total_mb))
    }

    pub fn set_used_bytes(&self, bytes: u64) {
        self.used_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_used_mb(&self, mb: f64) {
        self.set_used_bytes(mb_to_bytes(mb));
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

impl MemorySampler for ManualMemorySampler {
    fn sample(&self) -> MemorySample {
        let used = self.used_bytes();
        MemorySample {
            used_bytes: used,
            available_bytes: self.total_bytes.saturating_sub(used),
            total_bytes: self.total_bytes,
        }
    }
}

fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(0.0) * MB).round() as u64
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> Option<u64> {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(err) => {
            // Sandboxes without `/proc` are expected; anything else is worth a debug line.
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "regflow.memory",
                    error = %err,
                    "failed to read /proc/self/status while sampling rss"
                );
            }
            return None;
        }
    };

    let kb = status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?;
    match kb.parse::<u64>() {
        Ok(kb) => Some(kb.saturating_mul(1024)),
        Err(err) => {
            static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "regflow.memory",
                    value = kb,
                    error = %err,
                    "failed to parse VmRSS from /proc/self/status"
                );
            }
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> Option<u64> {
    None
}
