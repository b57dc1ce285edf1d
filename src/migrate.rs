use anyhow::Result;
use sqlx::SqlitePool;

/// Create the ledger and vector tables. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Ledger: one row per indexed note
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS note_index (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            embedding_model TEXT NOT NULL,
            last_indexed INTEGER NOT NULL,
            last_modified INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Singleton sync timestamps
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_full_sync INTEGER,
            last_incremental_sync INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO sync_metadata (id) VALUES (1)")
        .execute(pool)
        .await?;

    // Chunk vectors; seq orders insertions for tie-breaking
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            note_path TEXT NOT NULL,
            generation TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            folder TEXT NOT NULL,
            title TEXT NOT NULL,
            heading_path TEXT NOT NULL DEFAULT '[]',
            text TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            UNIQUE(note_path, generation, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_note ON chunk_vectors(note_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_folder ON chunk_vectors(folder)")
        .execute(pool)
        .await?;

    Ok(())
}
