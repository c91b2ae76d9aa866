use std::collections::BTreeMap;

use regflow_core::{ChunkId, ChunkRecord, Embedding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `content`.
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// A chunk as persisted by the [`crate::IntegrityStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: ChunkId,
    pub content: String,
    pub checksum: String,
    pub embedding: Option<Embedding>,
    pub metadata: BTreeMap<String, String>,
}

impl StoredRecord {
    /// Build a record with a fresh checksum and metadata derived from the chunk hierarchy.
    pub fn from_chunk(chunk: &ChunkRecord) -> Self {
        let mut metadata = chunk.hierarchy.attributes.clone();
        metadata.insert("id".to_owned(), chunk.id.0.to_string());
        metadata.insert("path".to_owned(), chunk.hierarchy.path.join("/"));
        metadata.insert("depth".to_owned(), chunk.hierarchy.depth.to_string());
        metadata.insert("tokens".to_owned(), chunk.token_count.to_string());
        Self {
            id: chunk.id,
            checksum: checksum(&chunk.content),
            content: chunk.content.clone(),
            embedding: chunk.embedding.clone(),
            metadata,
        }
    }

    pub fn checksum_matches(&self) -> bool {
        checksum(&self.content) == self.checksum
    }
}
