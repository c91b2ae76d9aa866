//! TOML configuration for the regflow pipeline.
//!
//! Every section is optional and every field has a default, so an empty file is a valid
//! configuration. Durations are written in milliseconds (`*_ms`). [`PipelineConfig::validate`]
//! reports every semantic problem in one pass; the `load_*` functions refuse configs that
//! have any.

use std::path::Path;
use std::time::Duration;

use regflow_cache::CacheConfig;
use regflow_integrity::IntegrityConfig;
use regflow_memory::{MemoryMonitorConfig, MemoryPressureThresholds};
use regflow_scheduler::{AllocationStrategy, BatchConfig, CircuitConfig, PermitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;
mod validation;

pub use logging::{init_tracing, LoggingConfig};
pub use validation::ConfigValidationError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub memory: MemorySection,
    pub permits: PermitSection,
    pub batching: BatchingSection,
    pub cache: CacheSection,
    pub retry: RetrySection,
    pub circuit: CircuitSection,
    pub integrity: IntegritySection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySection {
    pub sample_interval_ms: u64,
    /// `used / total` ratio that enters `moderate` pressure.
    pub moderate_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        let thresholds = MemoryPressureThresholds::default();
        Self {
            sample_interval_ms: 1_000,
            moderate_threshold: thresholds.moderate,
            high_threshold: thresholds.high,
            critical_threshold: thresholds.critical,
        }
    }
}

impl MemorySection {
    pub fn thresholds(&self) -> MemoryPressureThresholds {
        MemoryPressureThresholds {
            moderate: self.moderate_threshold,
            high: self.high_threshold,
            critical: self.critical_threshold,
        }
    }

    pub fn monitor_config(&self) -> MemoryMonitorConfig {
        MemoryMonitorConfig {
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            thresholds: self.thresholds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermitSection {
    pub total_permits: usize,
    pub memory_limit_mb: f64,
    pub strategy: AllocationStrategy,
    pub acquire_timeout_ms: u64,
    /// Fraction of `memory_limit_mb` that observed usage may not exceed.
    pub emergency_threshold: f64,
    pub emergency_cleanup: bool,
}

impl Default for PermitSection {
    fn default() -> Self {
        let defaults = PermitConfig::default();
        Self {
            total_permits: defaults.total_permits,
            memory_limit_mb: defaults.memory_limit_mb,
            strategy: defaults.strategy,
            acquire_timeout_ms: defaults.acquire_timeout.as_millis() as u64,
            emergency_threshold: defaults.emergency_threshold,
            emergency_cleanup: defaults.emergency_cleanup,
        }
    }
}

impl PermitSection {
    pub fn permit_config(&self) -> PermitConfig {
        PermitConfig {
            total_permits: self.total_permits,
            memory_limit_mb: self.memory_limit_mb,
            strategy: self.strategy,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            emergency_threshold: self.emergency_threshold,
            emergency_cleanup: self.emergency_cleanup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingSection {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub adjustment_step: usize,
    pub target_latency_ms: u64,
    pub max_concurrency: usize,
}

impl Default for BatchingSection {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            initial_batch_size: defaults.initial_batch_size,
            min_batch_size: defaults.min_batch_size,
            max_batch_size: defaults.max_batch_size,
            adjustment_step: defaults.adjustment_step,
            target_latency_ms: defaults.target_latency.as_millis() as u64,
            max_concurrency: defaults.max_concurrency,
        }
    }
}

impl BatchingSection {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            initial_batch_size: self.initial_batch_size,
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            adjustment_step: self.adjustment_step,
            target_latency: Duration::from_millis(self.target_latency_ms),
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    pub similarity_threshold: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            l1_capacity: defaults.l1_capacity,
            l2_capacity: defaults.l2_capacity,
            similarity_threshold: defaults.similarity_threshold,
        }
    }
}

impl CacheSection {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            l1_capacity: self.l1_capacity,
            l2_capacity: self.l2_capacity,
            similarity_threshold: self.similarity_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitSection {
    pub max_failures: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            max_failures: defaults.max_failures,
            cooldown_ms: defaults.cooldown.as_millis() as u64,
        }
    }
}

impl CircuitSection {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            max_failures: self.max_failures,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegritySection {
    pub expected_dimensions: usize,
    /// Metadata keys every stored record must carry.
    pub required_metadata: Vec<String>,
    pub scan_interval_ms: u64,
}

impl Default for IntegritySection {
    fn default() -> Self {
        let defaults = IntegrityConfig::default();
        Self {
            expected_dimensions: defaults.expected_dimensions,
            required_metadata: defaults.required_metadata,
            scan_interval_ms: defaults.scan_interval.as_millis() as u64,
        }
    }
}

impl IntegritySection {
    pub fn integrity_config(&self) -> IntegrityConfig {
        IntegrityConfig {
            expected_dimensions: self.expected_dimensions,
            required_metadata: self.required_metadata.clone(),
            scan_interval: Duration::from_millis(self.scan_interval_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {}", join_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

fn join_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl PipelineConfig {
    /// Load and validate a TOML config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::load_from_str(&text)?;
        tracing::debug!(target = "regflow.config", path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
