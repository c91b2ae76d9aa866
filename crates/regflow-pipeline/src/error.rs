use regflow_config::ConfigError;
use regflow_integrity::IntegrityError;
use regflow_scheduler::{CircuitOpen, PermitError, ProcessingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error(transparent)]
    Permit(#[from] PermitError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// `true` for errors that reject work without attempting it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::CircuitOpen(_) | PipelineError::Permit(_))
    }
}
