//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only way chunk vectors are written or
//! searched. Vectors are addressed by note key (the vault-relative path), so
//! a re-sync replaces exactly one note's prior chunks.
//!
//! Implementations:
//! - [`sqlite::SqliteVectorIndex`]: `chunk_vectors` table, brute-force cosine in Rust.
//! - [`memory::InMemoryVectorIndex`]: `RwLock<Vec<_>>`, for tests and embedding.
//!
//! # Contract
//!
//! - `upsert` replaces a note's vectors atomically from the caller's
//!   perspective: new vectors are written first, then older ones removed.
//!   If it fails, the previous set is still in place.
//! - `search` applies the folder filter before ranking and orders results by
//!   descending cosine similarity, ties broken by insertion recency (newer
//!   first).
//! - `search` never returns vectors for a note removed with `delete`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::models::{ChunkVector, RetrievedChunk};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace every vector stored under `note_key` with `vectors`.
    async fn upsert(&self, note_key: &str, vectors: &[ChunkVector]) -> Result<()>;

    /// Remove every vector stored under `note_key`. Deleting an absent key is not an error.
    async fn delete(&self, note_key: &str) -> Result<()>;

    /// Up to `k` nearest chunks to `query`, restricted by `filter`.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &FolderFilter,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Remove all vectors.
    async fn clear(&self) -> Result<()>;

    /// Distinct note keys that currently have vectors.
    async fn note_keys(&self) -> Result<HashSet<String>>;

    /// Total number of stored chunk vectors.
    async fn count(&self) -> Result<usize>;
}

/// Folder scope for a search. Empty means the whole vault.
///
/// A chunk matches a scope `A` when its folder is `A` or lies beneath it
/// (`A/...`). The empty string scope matches the vault root and everything
/// below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderFilter {
    scopes: Vec<String>,
}

impl FolderFilter {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scopes: Vec<String> = scopes
            .into_iter()
            .map(|s| s.as_ref().trim().trim_matches('/').to_string())
            .collect();
        scopes.sort();
        scopes.dedup();
        Self { scopes }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_unscoped(&self) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s.is_empty())
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn matches(&self, folder: &str) -> bool {
        if self.is_unscoped() {
            return true;
        }
        self.scopes.iter().any(|scope| {
            folder == scope
                || (folder.len() > scope.len()
                    && folder.starts_with(scope.as_str())
                    && folder.as_bytes()[scope.len()] == b'/')
        })
    }
}

/// Sort hits by descending score, then newer insertion first, and keep `k`.
pub(crate) fn rank(mut hits: Vec<(u64, RetrievedChunk)>, k: usize) -> Vec<RetrievedChunk> {
    hits.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| seq_b.cmp(seq_a))
    });
    hits.truncate(k);
    hits.into_iter().map(|(_, hit)| hit).collect()
}
