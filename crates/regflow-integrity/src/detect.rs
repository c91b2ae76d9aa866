use regflow_core::{l2_norm, ChunkId};
use serde::{Deserialize, Serialize};

use crate::record::StoredRecord;

/// Which parts of a record a scan looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanScope {
    Checksum,
    VectorIndex,
    Metadata,
    #[default]
    All,
}

impl ScanScope {
    fn covers(self, other: ScanScope) -> bool {
        self == ScanScope::All || self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptionKind {
    ChecksumMismatch,
    VectorDimension { expected: usize, actual: usize },
    VectorNonFinite,
    VectorZeroNorm,
    MetadataMissing { key: String },
    MetadataIdMismatch { found: String },
}

impl CorruptionKind {
    pub fn scope(&self) -> ScanScope {
        match self {
            CorruptionKind::ChecksumMismatch => ScanScope::Checksum,
            CorruptionKind::VectorDimension { .. }
            | CorruptionKind::VectorNonFinite
            | CorruptionKind::VectorZeroNorm => ScanScope::VectorIndex,
            CorruptionKind::MetadataMissing { .. } | CorruptionKind::MetadataIdMismatch { .. } => {
                ScanScope::Metadata
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: ChunkId,
    pub kind: CorruptionKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    pub scope: ScanScope,
    pub scanned: usize,
    pub corrupted: Vec<ChunkId>,
    pub findings: Vec<Finding>,
    /// `1 - corrupted / scanned`; `1.0` for an empty store.
    pub integrity_score: f64,
}

impl DetectionReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

/// Everything wrong with `record` within `scope`.
pub(crate) fn inspect(
    record: &StoredRecord,
    scope: ScanScope,
    expected_dimensions: usize,
    required_metadata: &[String],
) -> Vec<CorruptionKind> {
    let mut problems = Vec::new();

    if scope.covers(ScanScope::Checksum) && !record.checksum_matches() {
        problems.push(CorruptionKind::ChecksumMismatch);
    }

    if scope.covers(ScanScope::VectorIndex) {
        if let Some(embedding) = &record.embedding {
            let values = embedding.as_slice();
            if values.len() != expected_dimensions {
                problems.push(CorruptionKind::VectorDimension {
                    expected: expected_dimensions,
                    actual: values.len(),
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                problems.push(CorruptionKind::VectorNonFinite);
            } else if l2_norm(values) == 0.0 {
                problems.push(CorruptionKind::VectorZeroNorm);
            }
        }
    }

    if scope.covers(ScanScope::Metadata) {
        for key in required_metadata {
            if !record.metadata.contains_key(key) {
                problems.push(CorruptionKind::MetadataMissing { key: key.clone() });
            }
        }
        if let Some(found) = record.metadata.get("id") {
            if *found != record.id.0.to_string() {
                problems.push(CorruptionKind::MetadataIdMismatch {
                    found: found.clone(),
                });
            }
        }
    }

    problems
}
