use thiserror::Error;

use crate::{LoggingConfig, PipelineConfig};

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("{toml_path}: {message}")]
    InvalidValue { toml_path: String, message: String },
    #[error("batching.min_batch_size ({min}) exceeds batching.max_batch_size ({max})")]
    BatchBoundsInverted { min: usize, max: usize },
    #[error("memory thresholds must satisfy 0 < moderate < high < critical <= 1")]
    PressureThresholdsUnordered,
    #[error("logging.level `{value}` is not a valid filter")]
    LoggingLevelInvalid { value: String },
}

impl ConfigValidationError {
    fn invalid(toml_path: &str, message: &str) -> Self {
        ConfigValidationError::InvalidValue {
            toml_path: toml_path.to_owned(),
            message: message.to_owned(),
        }
    }
}

impl PipelineConfig {
    /// Semantic checks that serde cannot express. Reports every problem found.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut out = Vec::new();

        validate_memory(self, &mut out);
        validate_permits(self, &mut out);
        validate_batching(self, &mut out);
        validate_cache(self, &mut out);
        validate_retry(self, &mut out);
        validate_circuit(self, &mut out);
        validate_integrity(self, &mut out);
        validate_logging(self, &mut out);

        out
    }
}

fn require_nonzero(value: u64, toml_path: &str, out: &mut Vec<ConfigValidationError>) {
    if value == 0 {
        out.push(ConfigValidationError::invalid(toml_path, "must be >= 1"));
    }
}

fn validate_memory(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    require_nonzero(config.memory.sample_interval_ms, "memory.sample_interval_ms", out);
    if !config.memory.thresholds().is_valid() {
        out.push(ConfigValidationError::PressureThresholdsUnordered);
    }
}

fn validate_permits(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let permits = &config.permits;
    require_nonzero(permits.total_permits as u64, "permits.total_permits", out);
    if !(permits.memory_limit_mb.is_finite() && permits.memory_limit_mb > 0.0) {
        out.push(ConfigValidationError::invalid(
            "permits.memory_limit_mb",
            "must be a positive number",
        ));
    }
    if !(permits.emergency_threshold > 0.0 && permits.emergency_threshold <= 1.0) {
        out.push(ConfigValidationError::invalid(
            "permits.emergency_threshold",
            "must lie within (0, 1]",
        ));
    }
}

fn validate_batching(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let batching = &config.batching;
    require_nonzero(batching.min_batch_size as u64, "batching.min_batch_size", out);
    require_nonzero(batching.adjustment_step as u64, "batching.adjustment_step", out);
    require_nonzero(batching.target_latency_ms, "batching.target_latency_ms", out);
    require_nonzero(batching.max_concurrency as u64, "batching.max_concurrency", out);

    if batching.min_batch_size > batching.max_batch_size {
        out.push(ConfigValidationError::BatchBoundsInverted {
            min: batching.min_batch_size,
            max: batching.max_batch_size,
        });
    } else if !(batching.min_batch_size..=batching.max_batch_size)
        .contains(&batching.initial_batch_size)
    {
        out.push(ConfigValidationError::invalid(
            "batching.initial_batch_size",
            "must lie within [min_batch_size, max_batch_size]",
        ));
    }
}

fn validate_cache(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let cache = &config.cache;
    require_nonzero(cache.l1_capacity as u64, "cache.l1_capacity", out);
    require_nonzero(cache.l2_capacity as u64, "cache.l2_capacity", out);
    if !(cache.similarity_threshold > 0.0 && cache.similarity_threshold <= 1.0) {
        out.push(ConfigValidationError::invalid(
            "cache.similarity_threshold",
            "must lie within (0, 1]",
        ));
    }
}

fn validate_retry(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let retry = &config.retry;
    require_nonzero(u64::from(retry.max_attempts), "retry.max_attempts", out);
    if retry.base_delay_ms > retry.max_delay_ms {
        out.push(ConfigValidationError::invalid(
            "retry.base_delay_ms",
            "must not exceed retry.max_delay_ms",
        ));
    }
}

fn validate_circuit(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    require_nonzero(u64::from(config.circuit.max_failures), "circuit.max_failures", out);
}

fn validate_integrity(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let integrity = &config.integrity;
    require_nonzero(
        integrity.expected_dimensions as u64,
        "integrity.expected_dimensions",
        out,
    );
    require_nonzero(integrity.scan_interval_ms, "integrity.scan_interval_ms", out);
    if integrity.required_metadata.iter().any(|key| key.trim().is_empty()) {
        out.push(ConfigValidationError::invalid(
            "integrity.required_metadata",
            "keys must not be empty",
        ));
    }
}

fn validate_logging(config: &PipelineConfig, out: &mut Vec<ConfigValidationError>) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if tracing_subscriber::EnvFilter::try_new(normalized).is_err() {
        out.push(ConfigValidationError::LoggingLevelInvalid {
            value: config.logging.level.clone(),
        });
    }
}
