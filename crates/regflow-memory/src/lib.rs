//! Memory sampling and pressure classification for regflow.
//!
//! The monitor is deliberately passive: it samples a [`MemorySampler`], classifies the
//! result into a [`MemoryPressure`] level and remembers the peak. Components that react to
//! pressure (the permit pool, the caches) query the monitor or subscribe to
//! [`MemoryEvent`]s; the monitor never reaches into them.

mod monitor;
mod pressure;
mod report;
mod sampler;

pub use monitor::{MemoryEvent, MemoryMonitor, MemoryMonitorConfig};
pub use pressure::{MemoryPressure, MemoryPressureThresholds};
pub use report::MemoryReport;
pub use sampler::{ManualMemorySampler, MemorySample, MemorySampler, SystemMemorySampler};
