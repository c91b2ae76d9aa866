use regflow_cache::CacheStats;
use regflow_integrity::DetectionReport;
use regflow_memory::MemoryReport;
use regflow_metrics::MetricsSnapshot;
use regflow_scheduler::{AdaptationRecord, CircuitSnapshot, PermitAdjustment, PermitStats};
use serde::Serialize;

/// Read-only view of the pipeline's runtime state, taken without side effects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub memory: MemoryReport,
    pub permits: PermitStats,
    pub permit_adjustments: Vec<PermitAdjustment>,
    pub current_batch_size: usize,
    pub adaptation_history: Vec<AdaptationRecord>,
    pub chunk_cache: CacheStats,
    pub breakers: Vec<CircuitSnapshot>,
    pub last_integrity_scan: Option<DetectionReport>,
    pub quarantined_chunks: usize,
    pub metrics: MetricsSnapshot,
}
