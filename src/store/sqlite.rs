//! SQLite-backed [`VectorIndex`].
//!
//! Vectors live in the `chunk_vectors` table as little-endian `f32` BLOBs
//! next to the chunk metadata. The folder filter runs in SQL so only in-scope
//! rows are loaded; cosine similarity is computed in Rust.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{rank, FolderFilter, VectorIndex};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkVector, RetrievedChunk};

#[derive(Clone)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    /// Wrap a pool whose schema has been created by [`crate::migrate::run_migrations`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// `WHERE` clause restricting `folder` to the filter's scopes, with one bind
/// value per placeholder.
fn folder_clause(filter: &FolderFilter) -> (String, Vec<String>) {
    if filter.is_unscoped() {
        return (String::new(), Vec::new());
    }
    let mut parts = Vec::new();
    let mut binds = Vec::new();
    for scope in filter.scopes() {
        parts.push("(folder = ? OR substr(folder, 1, length(?) + 1) = ? || '/')");
        binds.extend([scope.clone(), scope.clone(), scope.clone()]);
    }
    (format!(" WHERE {}", parts.join(" OR ")), binds)
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, note_key: &str, vectors: &[ChunkVector]) -> Result<()> {
        let generation = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        // Write the new generation first, then drop older ones
        for cv in vectors {
            let chunk = &cv.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors
                    (note_path, generation, ordinal, folder, title, heading_path,
                     text, span_start, span_end, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(note_key)
            .bind(&generation)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.folder)
            .bind(&chunk.title)
            .bind(serde_json::to_string(&chunk.heading_path)?)
            .bind(&chunk.text)
            .bind(chunk.span_start as i64)
            .bind(chunk.span_end as i64)
            .bind(cv.vector.len() as i64)
            .bind(vec_to_blob(&cv.vector))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM chunk_vectors WHERE note_path = ? AND generation != ?")
            .bind(note_key)
            .bind(&generation)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, note_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE note_path = ?")
            .bind(note_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &FolderFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let (clause, binds) = folder_clause(filter);
        let sql = format!(
            "SELECT seq, note_path, ordinal, folder, title, heading_path, text, embedding \
             FROM chunk_vectors{}",
            clause
        );
        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let vector = blob_to_vec(&blob);
            let heading_json: String = row.try_get("heading_path")?;
            let seq: i64 = row.try_get("seq")?;
            let ordinal: i64 = row.try_get("ordinal")?;
            hits.push((
                seq as u64,
                RetrievedChunk {
                    note_path: row.try_get("note_path")?,
                    ordinal: ordinal as usize,
                    text: row.try_get("text")?,
                    heading_path: serde_json::from_str(&heading_json).unwrap_or_default(),
                    folder: row.try_get("folder")?,
                    title: row.try_get("title")?,
                    score: cosine_similarity(query, &vector),
                },
            ));
        }

        Ok(rank(hits, k))
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn note_keys(&self) -> Result<HashSet<String>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT DISTINCT note_path FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
