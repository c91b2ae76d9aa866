use regflow_core::MB;
use serde::{Deserialize, Serialize};

use crate::pressure::MemoryPressure;

/// Snapshot of memory state intended for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub peak_bytes: u64,
    pub pressure: MemoryPressure,
}

impl MemoryReport {
    pub fn used_mb(&self) -> f64 {
        self.used_bytes as f64 / MB
    }

    pub fn available_mb(&self) -> f64 {
        self.available_bytes as f64 / MB
    }

    pub fn peak_mb(&self) -> f64 {
        self.peak_bytes as f64 / MB
    }

    pub fn usage_ratio(&self) -> f64 {
        self.used_bytes as f64 / self.total_bytes.max(1) as f64
    }
}
