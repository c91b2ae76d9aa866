use regflow_core::ChunkId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("corruption detected in {id}")]
    CorruptionDetected { id: ChunkId },
    #[error("no stored record for {id}")]
    UnknownRecord { id: ChunkId },
}
