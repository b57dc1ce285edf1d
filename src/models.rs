//! Core data models.
//!
//! Notes are read fresh on every scan and never persisted. Chunks and their
//! vectors live in the vector index keyed by note path; [`IndexEntry`] rows
//! record what the index currently holds for each note.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A markdown note read from the vault.
#[derive(Debug, Clone)]
pub struct Note {
    /// Vault-relative path with `/` separators, e.g. `projects/alpha.md`.
    pub path: String,
    pub text: String,
    pub modified: DateTime<Utc>,
    /// SHA-256 hex digest of the raw file bytes.
    pub fingerprint: String,
    pub title: String,
    /// Parent directory of the note, `""` at the vault root.
    pub folder: String,
}

/// A bounded span of a note, the unit of embedding and retrieval.
///
/// Identity is `(note_path, ordinal)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub note_path: String,
    pub ordinal: usize,
    pub text: String,
    /// Byte offsets of `text` within the note's raw text. Empty (`0..0`) for
    /// the synthetic title chunk of a note with no body.
    pub span_start: usize,
    pub span_end: usize,
    pub heading_path: Vec<String>,
    pub folder: String,
    pub title: String,
}

impl Chunk {
    pub fn heading(&self) -> Option<String> {
        if self.heading_path.is_empty() {
            None
        } else {
            Some(self.heading_path.join(" > "))
        }
    }

    /// Text sent to the embedding provider: heading context, then the span.
    pub fn embedding_input(&self) -> String {
        match self.heading() {
            Some(heading) => format!("{}\n\n{}", heading, self.text),
            None => self.text.clone(),
        }
    }
}

/// A chunk paired with its embedding vector, ready for the vector index.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Ledger row describing what the vector index holds for one note.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub path: String,
    pub content_hash: String,
    pub chunk_count: usize,
    pub embedding_model: String,
    pub last_indexed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetadata {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_incremental_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

/// A search hit: stored chunk metadata plus similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub note_path: String,
    pub ordinal: usize,
    pub text: String,
    pub heading_path: Vec<String>,
    pub folder: String,
    pub title: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

impl RetrievedChunk {
    pub fn heading(&self) -> Option<String> {
        if self.heading_path.is_empty() {
            None
        } else {
            Some(self.heading_path.join(" > "))
        }
    }
}
