//! Index ledger.
//!
//! The `note_index` table records, per note path, the fingerprint, chunk
//! count and embedding model of the vectors currently in the index. A row is
//! written only after the note's vectors are committed and removed only after
//! they are deleted, so the ledger always describes what the index holds.
//! `sync_metadata` is a singleton row with the last full and incremental
//! sync times.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{IndexEntry, SyncMetadata, SyncMode};

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexEntry> {
    let chunk_count: i64 = row.try_get("chunk_count")?;
    Ok(IndexEntry {
        path: row.try_get("path")?,
        content_hash: row.try_get("content_hash")?,
        chunk_count: chunk_count as usize,
        embedding_model: row.try_get("embedding_model")?,
        last_indexed: from_ts(row.try_get("last_indexed")?),
        last_modified: from_ts(row.try_get("last_modified")?),
    })
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn entries(&self) -> Result<HashMap<String, IndexEntry>> {
        let rows = sqlx::query(
            "SELECT path, content_hash, chunk_count, embedding_model, last_indexed, last_modified \
             FROM note_index",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in &rows {
            let entry = entry_from_row(row)?;
            entries.insert(entry.path.clone(), entry);
        }
        Ok(entries)
    }

    pub async fn get(&self, path: &str) -> Result<Option<IndexEntry>> {
        let row = sqlx::query(
            "SELECT path, content_hash, chunk_count, embedding_model, last_indexed, last_modified \
             FROM note_index WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO note_index
                (path, content_hash, chunk_count, embedding_model, last_indexed, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                embedding_model = excluded.embedding_model,
                last_indexed = excluded.last_indexed,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.content_hash)
        .bind(entry.chunk_count as i64)
        .bind(&entry.embedding_model)
        .bind(entry.last_indexed.timestamp())
        .bind(entry.last_modified.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM note_index WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every entry and reset sync timestamps.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM note_index")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE sync_metadata SET last_full_sync = NULL, last_incremental_sync = NULL WHERE id = 1",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn metadata(&self) -> Result<SyncMetadata> {
        let row = sqlx::query(
            "SELECT last_full_sync, last_incremental_sync FROM sync_metadata WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncMetadata::default());
        };
        let full: Option<i64> = row.try_get("last_full_sync")?;
        let incremental: Option<i64> = row.try_get("last_incremental_sync")?;
        Ok(SyncMetadata {
            last_full_sync: full.map(from_ts),
            last_incremental_sync: incremental.map(from_ts),
        })
    }

    pub async fn mark_synced(&self, mode: SyncMode, at: DateTime<Utc>) -> Result<()> {
        let column = match mode {
            SyncMode::Full => "last_full_sync",
            SyncMode::Incremental => "last_incremental_sync",
        };
        sqlx::query(&format!(
            "INSERT INTO sync_metadata (id, {col}) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET {col} = excluded.{col}",
            col = column
        ))
        .bind(at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
