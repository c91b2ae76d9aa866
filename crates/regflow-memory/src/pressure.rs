use serde::{Deserialize, Serialize};

/// Coarse-grained memory pressure levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Moderate,
    High,
    Critical,
}

/// Thresholds for computing [`MemoryPressure`] from `used / total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryPressureThresholds {
    /// Enter `Moderate` when `used / total >= moderate`.
    pub moderate: f64,
    /// Enter `High` when `used / total >= high`.
    pub high: f64,
    /// Enter `Critical` when `used / total >= critical`.
    pub critical: f64,
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            moderate: 0.70,
            high: 0.85,
            critical: 0.95,
        }
    }
}

impl MemoryPressureThresholds {
    pub fn level_for_ratio(self, ratio: f64) -> MemoryPressure {
        if ratio >= self.critical {
            MemoryPressure::Critical
        } else if ratio >= self.high {
            MemoryPressure::High
        } else if ratio >= self.moderate {
            MemoryPressure::Moderate
        } else {
            MemoryPressure::Normal
        }
    }

    /// Thresholds must be strictly increasing and within `(0, 1]`.
    pub fn is_valid(self) -> bool {
        0.0 < self.moderate
            && self.moderate < self.high
            && self.high < self.critical
            && self.critical <= 1.0
    }
}
