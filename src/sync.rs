//! Sync orchestrator.
//!
//! Composes scanner → change detector → chunker → embedding batcher →
//! vector index → ledger into one incremental or full pass:
//!
//! ```text
//! Scanning → Diffing → (Embedding → Writing)* → Finalizing → Done
//!     └──────────────┴──────────────────────────┴──→ Failed
//! ```
//!
//! Each note is committed on its own: vectors are upserted, then the ledger
//! row is written. A note that fails to embed or write is reported in
//! [`SyncResult::failures`] with its ledger row and previous vectors left in
//! place, so it stays pending for the next run. Deleted notes lose their
//! vectors before their ledger row.
//!
//! Only one run may be active per [`SyncService`]; a second caller gets
//! [`VaultError::ConcurrencyConflict`] immediately instead of waiting.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::chunk::chunk_note;
use crate::config::{ChunkingConfig, Config, VaultConfig};
use crate::diff::detect_changes;
use crate::embedding::batch::{BatchSettings, EmbeddingBatcher, NoteChunks};
use crate::embedding::EmbeddingProvider;
use crate::error::{VaultError, VaultResult};
use crate::ledger::Ledger;
use crate::models::{Chunk, ChunkVector, IndexEntry, Note, SyncMode};
use crate::pricing::PriceTable;
use crate::progress::{SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::scanner::{scan_vault, ScanReport};
use crate::store::VectorIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub note_path: String,
    pub reason: String,
}

/// Summary of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub mode: SyncMode,
    pub notes_added: usize,
    pub notes_updated: usize,
    pub notes_deleted: usize,
    pub notes_unchanged: usize,
    pub chunks_created: usize,
    pub embedding_tokens_used: u64,
    /// USD, rounded to six decimals.
    pub embedding_cost: f64,
    pub duration_seconds: f64,
    pub failures: Vec<SyncFailure>,
    /// The run stopped early; notes committed before cancellation remain indexed.
    pub cancelled: bool,
}

impl SyncResult {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            notes_added: 0,
            notes_updated: 0,
            notes_deleted: 0,
            notes_unchanged: 0,
            chunks_created: 0,
            embedding_tokens_used: 0,
            embedding_cost: 0.0,
            duration_seconds: 0.0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// True when the run changed nothing in the index.
    pub fn is_noop(&self) -> bool {
        self.notes_added == 0
            && self.notes_updated == 0
            && self.notes_deleted == 0
            && self.chunks_created == 0
            && self.embedding_tokens_used == 0
            && self.failures.is_empty()
    }
}

/// Index health as seen by an operator.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    /// Markdown notes currently in the vault.
    pub total_notes: usize,
    /// Notes with a ledger row.
    pub indexed_notes: usize,
    /// Notes new or changed since their last embed.
    pub pending_notes: usize,
    /// Ledger rows whose note is gone from the vault.
    pub deleted_notes: usize,
    pub unreadable_notes: usize,
    pub embedding_model: String,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_incremental_sync: Option<DateTime<Utc>>,
}

pub struct SyncService {
    vault: VaultConfig,
    chunking: ChunkingConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    batcher: EmbeddingBatcher,
    index: Arc<dyn VectorIndex>,
    ledger: Ledger,
    prices: PriceTable,
    gate: Mutex<()>,
}

/// Chunks of one note in the current wave, plus whether it replaces an existing entry.
struct PendingNote<'a> {
    note: &'a Note,
    is_update: bool,
    chunks: Vec<Chunk>,
}

struct Progress<'a> {
    reporter: &'a dyn SyncProgressReporter,
    done: u64,
    total: u64,
}

impl Progress<'_> {
    fn phase(&self, phase: SyncPhase) {
        tracing::debug!(phase = phase.as_str(), "sync phase");
        self.reporter.report(SyncProgressEvent::Phase(phase));
    }

    fn note_done(&mut self) {
        self.done += 1;
        self.reporter.report(SyncProgressEvent::Notes {
            done: self.done,
            total: self.total,
        });
    }
}

impl SyncService {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        ledger: Ledger,
    ) -> Self {
        let batcher =
            EmbeddingBatcher::new(embedder.clone(), BatchSettings::from(&config.embedding));
        Self {
            vault: config.vault.clone(),
            chunking: config.chunking.clone(),
            embedder,
            batcher,
            index,
            ledger,
            prices: PriceTable::new(config.pricing.clone()),
            gate: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Run one sync pass. Fails fast with [`VaultError::ConcurrencyConflict`]
    /// if another run holds the gate.
    pub async fn run(
        &self,
        mode: SyncMode,
        reporter: &dyn SyncProgressReporter,
        cancel: &CancellationToken,
    ) -> VaultResult<SyncResult> {
        let _guard = self
            .gate
            .try_lock()
            .map_err(|_| VaultError::ConcurrencyConflict)?;

        let started = Instant::now();
        tracing::info!(%mode, vault = %self.vault.root.display(), "sync started");

        let mut progress = Progress {
            reporter,
            done: 0,
            total: 0,
        };
        match self.run_locked(mode, &mut progress, cancel).await {
            Ok(mut result) => {
                result.duration_seconds = started.elapsed().as_secs_f64();
                progress.phase(SyncPhase::Done);
                tracing::info!(
                    added = result.notes_added,
                    updated = result.notes_updated,
                    deleted = result.notes_deleted,
                    chunks = result.chunks_created,
                    tokens = result.embedding_tokens_used,
                    failures = result.failures.len(),
                    cancelled = result.cancelled,
                    "sync finished"
                );
                Ok(result)
            }
            Err(err) => {
                progress.phase(SyncPhase::Failed);
                tracing::error!(error = %err, "sync failed");
                Err(err)
            }
        }
    }

    async fn run_locked(
        &self,
        mode: SyncMode,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) -> VaultResult<SyncResult> {
        let mut result = SyncResult::new(mode);
        let model = self.embedder.model_name().to_string();

        progress.phase(SyncPhase::Scanning);
        let report = scan(&self.vault).await?;
        for unreadable in &report.unreadable {
            result.failures.push(SyncFailure {
                note_path: unreadable.path.clone(),
                reason: unreadable.to_error().to_string(),
            });
        }

        progress.phase(SyncPhase::Diffing);
        if mode == SyncMode::Full {
            self.index.clear().await?;
            self.ledger.clear().await?;
        }
        let entries = self.ledger.entries().await?;
        let keys = self.index.note_keys().await?;
        let unreadable: HashSet<String> =
            report.unreadable.iter().map(|u| u.path.clone()).collect();
        let changes = detect_changes(&report.notes, &entries, &unreadable, Some(&keys), &model);

        for path in &changes.inconsistent {
            let err = VaultError::IndexConsistency {
                path: path.clone(),
                message: "ledger entry has no vectors; re-indexing".to_string(),
            };
            tracing::warn!("{}", err);
        }
        result.notes_unchanged = changes.unchanged.len();
        progress.total =
            (changes.added.len() + changes.updated.len() + changes.deleted.len()) as u64;

        // Deletions: vectors first, then the ledger row
        for path in &changes.deleted {
            if cancel.is_cancelled() {
                break;
            }
            match self.delete_note(path).await {
                Ok(()) => result.notes_deleted += 1,
                Err(err) => result.failures.push(SyncFailure {
                    note_path: path.clone(),
                    reason: format!("{:#}", err),
                }),
            }
            progress.note_done();
        }
        for path in &changes.orphans {
            if cancel.is_cancelled() {
                break;
            }
            tracing::warn!(note = %path, "removing vectors with no ledger entry");
            if let Err(err) = self.index.delete(path).await {
                tracing::warn!(note = %path, error = %err, "failed to remove orphaned vectors");
            }
        }

        let by_path: HashMap<&str, &Note> =
            report.notes.iter().map(|n| (n.path.as_str(), n)).collect();
        let work = changes
            .added
            .iter()
            .map(|p| (p, false))
            .chain(changes.updated.iter().map(|p| (p, true)))
            .filter_map(|(p, is_update)| by_path.get(p.as_str()).map(|n| (*n, is_update)));

        let settings = self.batcher.settings();
        let wave_budget = settings.batch_size * settings.max_concurrency;
        let mut wave: Vec<PendingNote<'_>> = Vec::new();
        let mut wave_chunks = 0usize;

        for (note, is_update) in work {
            if cancel.is_cancelled() {
                break;
            }
            let chunks = chunk_note(note, &self.chunking);
            wave_chunks += chunks.len();
            wave.push(PendingNote {
                note,
                is_update,
                chunks,
            });
            if wave_chunks >= wave_budget {
                self.process_wave(std::mem::take(&mut wave), &model, &mut result, progress, cancel)
                    .await;
                wave_chunks = 0;
            }
        }
        if !wave.is_empty() && !cancel.is_cancelled() {
            self.process_wave(wave, &model, &mut result, progress, cancel).await;
        }

        result.embedding_cost = self
            .prices
            .embedding_cost(&model, result.embedding_tokens_used);

        if cancel.is_cancelled() {
            result.cancelled = true;
            tracing::warn!("sync cancelled; notes committed so far remain indexed");
            return Ok(result);
        }

        progress.phase(SyncPhase::Finalizing);
        self.ledger.mark_synced(mode, Utc::now()).await?;
        Ok(result)
    }

    /// Embed one wave of notes, then commit each embedded note in turn.
    async fn process_wave(
        &self,
        wave: Vec<PendingNote<'_>>,
        model: &str,
        result: &mut SyncResult,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) {
        progress.phase(SyncPhase::Embedding);
        let mut owners: HashMap<String, (&Note, bool)> = HashMap::with_capacity(wave.len());
        let requests: Vec<NoteChunks> = wave
            .into_iter()
            .map(|pending| {
                owners.insert(
                    pending.note.path.clone(),
                    (pending.note, pending.is_update),
                );
                NoteChunks {
                    note_path: pending.note.path.clone(),
                    chunks: pending.chunks,
                }
            })
            .collect();

        let outcome = self.batcher.embed_notes(requests).await;
        result.embedding_tokens_used += outcome.tokens;

        for failed in outcome.failed {
            tracing::warn!(note = %failed.note_path, reason = %failed.reason, "note not embedded");
            result.failures.push(SyncFailure {
                note_path: failed.note_path,
                reason: failed.reason,
            });
            progress.note_done();
        }

        progress.phase(SyncPhase::Writing);
        for embedded in outcome.embedded {
            if cancel.is_cancelled() {
                return;
            }
            let Some(&(note, is_update)) = owners.get(&embedded.note_path) else {
                continue;
            };
            match self.commit_note(note, &embedded.vectors, model).await {
                Ok(()) => {
                    if is_update {
                        result.notes_updated += 1;
                    } else {
                        result.notes_added += 1;
                    }
                    result.chunks_created += embedded.vectors.len();
                    tracing::debug!(
                        note = %note.path,
                        chunks = embedded.vectors.len(),
                        "note indexed"
                    );
                }
                Err(err) => {
                    tracing::warn!(note = %note.path, error = %err, "note not written");
                    result.failures.push(SyncFailure {
                        note_path: note.path.clone(),
                        reason: format!("{:#}", err),
                    });
                }
            }
            progress.note_done();
        }
    }

    /// Replace a note's vectors, then record it in the ledger.
    async fn commit_note(
        &self,
        note: &Note,
        vectors: &[ChunkVector],
        model: &str,
    ) -> anyhow::Result<()> {
        self.index
            .upsert(&note.path, vectors)
            .await
            .context("vector upsert failed")?;

        let entry = IndexEntry {
            path: note.path.clone(),
            content_hash: note.fingerprint.clone(),
            chunk_count: vectors.len(),
            embedding_model: model.to_string(),
            last_indexed: Utc::now(),
            last_modified: note.modified,
        };
        if let Err(err) = self.ledger.upsert(&entry).await {
            let inconsistency = VaultError::IndexConsistency {
                path: note.path.clone(),
                message: "vectors replaced but ledger not updated; will re-index".to_string(),
            };
            tracing::warn!("{}", inconsistency);
            return Err(err.context("ledger update failed"));
        }
        Ok(())
    }

    async fn delete_note(&self, path: &str) -> anyhow::Result<()> {
        self.index
            .delete(path)
            .await
            .context("vector delete failed")?;
        self.ledger
            .delete(path)
            .await
            .context("ledger delete failed")?;
        tracing::debug!(note = %path, "note removed from index");
        Ok(())
    }

    pub async fn status(&self) -> VaultResult<IndexStatus> {
        index_status(&self.vault, &self.ledger, self.embedder.model_name()).await
    }
}

/// Compare the vault against the ledger without touching the vector index.
pub async fn index_status(
    vault: &VaultConfig,
    ledger: &Ledger,
    embedding_model: &str,
) -> VaultResult<IndexStatus> {
    let report = scan(vault).await?;
    let entries = ledger.entries().await?;
    let unreadable: HashSet<String> = report.unreadable.iter().map(|u| u.path.clone()).collect();
    let changes = detect_changes(&report.notes, &entries, &unreadable, None, embedding_model);
    let meta = ledger.metadata().await?;

    Ok(IndexStatus {
        total_notes: report.notes.len(),
        indexed_notes: entries.len(),
        pending_notes: changes.added.len() + changes.updated.len(),
        deleted_notes: changes.deleted.len(),
        unreadable_notes: report.unreadable.len(),
        embedding_model: embedding_model.to_string(),
        last_full_sync: meta.last_full_sync,
        last_incremental_sync: meta.last_incremental_sync,
    })
}

/// Walk the vault on the blocking pool; file reads must not stall the runtime.
async fn scan(vault: &VaultConfig) -> VaultResult<ScanReport> {
    let vault = vault.clone();
    tokio::task::spawn_blocking(move || scan_vault(&vault))
        .await
        .map_err(|e| VaultError::Other(anyhow::anyhow!("scan task failed: {}", e)))?
}
