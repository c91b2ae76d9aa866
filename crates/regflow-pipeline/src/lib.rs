//! Pipeline coordination for regflow.
//!
//! [`PipelineCoordinator`] wires the memory monitor, permit pool, adaptive batch scheduler,
//! retry controller and circuit breakers into one entry point for processing chunks.
//! [`CachedEmbedder`] and [`ChunkStore`] are the embedding and storage collaborators, each
//! fronted by a multi-tier cache.

mod coordinator;
mod embedding;
mod error;
mod snapshot;
mod storage;

pub use coordinator::{CoordinatorBuilder, PipelineBatchReport, PipelineCoordinator};
pub use embedding::{CachedEmbedder, Embedder};
pub use error::PipelineError;
pub use snapshot::PipelineSnapshot;
pub use storage::ChunkStore;
