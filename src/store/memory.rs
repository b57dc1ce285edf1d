//! In-memory [`VectorIndex`] for tests and embedding in other programs.
//!
//! Uses a `Vec` behind `std::sync::RwLock`. Search is brute-force cosine
//! similarity over the entries that pass the folder filter.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{rank, FolderFilter, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::models::{Chunk, ChunkVector, RetrievedChunk};

struct StoredVector {
    seq: u64,
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<StoredVector>,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryVectorIndex {
    inner: RwLock<Inner>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("vector index lock poisoned")
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, note_key: &str, vectors: &[ChunkVector]) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let first_seq = inner.next_seq;
        let fresh: Vec<StoredVector> = vectors
            .iter()
            .enumerate()
            .map(|(i, cv)| StoredVector {
                seq: first_seq + i as u64,
                chunk: cv.chunk.clone(),
                vector: cv.vector.clone(),
            })
            .collect();
        inner.next_seq += fresh.len() as u64;
        inner.entries.retain(|sv| sv.chunk.note_path != note_key);
        inner.entries.extend(fresh);
        Ok(())
    }

    async fn delete(&self, note_key: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.entries.retain(|sv| sv.chunk.note_path != note_key);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &FolderFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let hits = inner
            .entries
            .iter()
            .filter(|sv| filter.matches(&sv.chunk.folder))
            .map(|sv| {
                let chunk = &sv.chunk;
                (
                    sv.seq,
                    RetrievedChunk {
                        note_path: chunk.note_path.clone(),
                        ordinal: chunk.ordinal,
                        text: chunk.text.clone(),
                        heading_path: chunk.heading_path.clone(),
                        folder: chunk.folder.clone(),
                        title: chunk.title.clone(),
                        score: cosine_similarity(query, &sv.vector),
                    },
                )
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.entries.clear();
        Ok(())
    }

    async fn note_keys(&self) -> Result<HashSet<String>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .entries
            .iter()
            .map(|sv| sv.chunk.note_path.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poisoned)?.entries.len())
    }
}
