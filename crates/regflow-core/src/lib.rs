//! Core types shared across the regflow crates.
//!
//! This crate has no runtime of its own. It defines the records exchanged with the
//! chunking/embedding collaborators, the injectable [`Clock`], vector similarity helpers
//! and the failure-classification seam used by the retry controller.

mod clock;
mod failure;
mod record;
mod similarity;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use failure::{
    FailureClass, FailureInjector, InjectedFailure, NoFailures, ScriptedFailures,
};
pub use record::{ChunkId, ChunkRecord, Embedding, HierarchyMetadata, Priority, MB};
pub use similarity::{cosine_similarity, l2_norm};
