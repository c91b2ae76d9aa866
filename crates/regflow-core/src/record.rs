use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MB: f64 = 1024.0 * 1024.0;

/// Smallest memory estimate handed to the permit pool for a single chunk.
const MIN_ESTIMATE_MB: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Scheduling priority for chunks and permit requests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Fixed-dimension embedding vector produced by the embedding collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.0.len() * std::mem::size_of::<f32>()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Position of a chunk inside the regulation it was extracted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyMetadata {
    /// Path from the document root, e.g. `["FAR", "Part 15", "15.404-1"]`.
    pub path: Vec<String>,
    pub depth: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Chunk record produced by the chunking collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub content: String,
    pub token_count: u32,
    #[serde(default)]
    pub embedding: Option<Embedding>,
    #[serde(default)]
    pub hierarchy: HierarchyMetadata,
    #[serde(default)]
    pub priority: Priority,
}

impl ChunkRecord {
    pub fn new(id: ChunkId, content: impl Into<String>) -> Self {
        let content = content.into();
        // Whitespace tokens are a close enough stand-in for the chunker's count.
        let token_count = content.split_whitespace().count() as u32;
        Self {
            id,
            content,
            token_count,
            embedding: None,
            hierarchy: HierarchyMetadata::default(),
            priority: Priority::Normal,
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hierarchy(mut self, hierarchy: HierarchyMetadata) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    /// Approximate working-set size while this chunk is being processed.
    pub fn estimated_memory_mb(&self) -> f64 {
        let embedding = self.embedding.as_ref().map_or(0, Embedding::size_bytes);
        let bytes = self.content.len() + embedding;
        (bytes as f64 / MB).max(MIN_ESTIMATE_MB)
    }
}
