//! Embedding batcher.
//!
//! Flattens the chunks of many notes into one queue, partitions it into
//! batches of at most `batch_size` inputs and embeds them with at most
//! `max_concurrency` requests in flight. Transient failures are retried with
//! exponential backoff; exhaustion or a permanent failure fails every note
//! that had a chunk in the batch. The caller gets back which notes were
//! fully embedded and which failed, so failed notes can be left untouched.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{estimate_tokens, Embedded, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::models::{Chunk, ChunkVector};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl From<&EmbeddingConfig> for BatchSettings {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }
}

/// All chunks of one note awaiting vectors.
#[derive(Debug, Clone)]
pub struct NoteChunks {
    pub note_path: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub struct EmbeddedNote {
    pub note_path: String,
    /// One entry per chunk, in ordinal order.
    pub vectors: Vec<ChunkVector>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedNote {
    pub note_path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Fully embedded notes, in input order.
    pub embedded: Vec<EmbeddedNote>,
    pub failed: Vec<FailedNote>,
    pub tokens: u64,
}

/// Backoff before retry `attempt` (1-based): `base * 2^(attempt-1)`, exponent capped at 5.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.saturating_sub(1).min(5))
}

pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
    settings: BatchSettings,
}

impl EmbeddingBatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, settings: BatchSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub async fn embed_notes(&self, notes: Vec<NoteChunks>) -> BatchOutcome {
        let mut owners: Vec<usize> = Vec::new();
        let mut inputs: Vec<String> = Vec::new();
        for (note_idx, note) in notes.iter().enumerate() {
            for chunk in &note.chunks {
                owners.push(note_idx);
                inputs.push(chunk.embedding_input());
            }
        }

        let ranges: Vec<(usize, usize)> = (0..inputs.len())
            .step_by(self.settings.batch_size)
            .map(|start| (start, (start + self.settings.batch_size).min(inputs.len())))
            .collect();

        let inputs_ref = &inputs;
        let results: Vec<((usize, usize), Result<Embedded, ProviderError>)> =
            stream::iter(ranges)
                .map(|(start, end)| async move {
                    let result = self.embed_with_retry(&inputs_ref[start..end]).await;
                    ((start, end), result)
                })
                .buffer_unordered(self.settings.max_concurrency)
                .collect()
                .await;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();
        let mut tokens = 0u64;

        for ((start, end), result) in results {
            match result {
                Ok(embedded) => {
                    tokens += embedded
                        .tokens
                        .unwrap_or_else(|| estimate_tokens(&inputs[start..end]));
                    for (offset, vector) in embedded.vectors.into_iter().enumerate() {
                        slots[start + offset] = Some(vector);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        provider = self.provider.provider_name(),
                        batch_start = start,
                        batch_len = end - start,
                        error = %err,
                        "embedding batch failed"
                    );
                    for &note_idx in &owners[start..end] {
                        failures.entry(note_idx).or_insert_with(|| err.to_string());
                    }
                }
            }
        }

        if let Some(dims) = self.provider.dims() {
            for (i, slot) in slots.iter().enumerate() {
                if let Some(vector) = slot {
                    if vector.len() != dims {
                        failures.entry(owners[i]).or_insert_with(|| {
                            format!("expected {} dimensions, got {}", dims, vector.len())
                        });
                    }
                }
            }
        }

        let mut outcome = BatchOutcome {
            tokens,
            ..Default::default()
        };
        let mut slots = slots.into_iter();
        for (note_idx, note) in notes.into_iter().enumerate() {
            let note_slots: Vec<Option<Vec<f32>>> = slots.by_ref().take(note.chunks.len()).collect();
            if let Some(reason) = failures.remove(&note_idx) {
                outcome.failed.push(FailedNote {
                    note_path: note.note_path,
                    reason,
                });
                continue;
            }
            let vectors: Option<Vec<ChunkVector>> = note
                .chunks
                .into_iter()
                .zip(note_slots)
                .map(|(chunk, vector)| vector.map(|vector| ChunkVector { chunk, vector }))
                .collect();
            match vectors {
                Some(vectors) => outcome.embedded.push(EmbeddedNote {
                    note_path: note.note_path,
                    vectors,
                }),
                None => outcome.failed.push(FailedNote {
                    note_path: note.note_path,
                    reason: "missing embedding for chunk".to_string(),
                }),
            }
        }

        outcome
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Embedded, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.provider.embed(texts).await {
                Ok(embedded) => {
                    if embedded.vectors.len() != texts.len() {
                        return Err(ProviderError::permanent(
                            self.provider.provider_name(),
                            format!(
                                "returned {} embeddings for {} inputs",
                                embedded.vectors.len(),
                                texts.len()
                            ),
                        ));
                    }
                    return Ok(embedded);
                }
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(self.settings.retry_base, attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying embedding batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted provider: fails the first `transient_failures` calls, and
    /// permanently fails any batch containing `poison`.
    struct ScriptedEmbedder {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        transient_failures: usize,
        poison: Option<String>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedEmbedder {
        fn new(transient_failures: usize, poison: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                transient_failures,
                poison: poison.map(String::from),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedEmbedder {
        fn provider_name(&self) -> &str {
            "scripted"
        }
        fn model_name(&self) -> &str {
            "scripted-1"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed(&self, texts: &[String]) -> Result<Embedded, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if call < self.transient_failures {
                return Err(ProviderError::transient("scripted", "rate limited"));
            }
            if let Some(poison) = &self.poison {
                if texts.iter().any(|t| t.contains(poison.as_str())) {
                    return Err(ProviderError::permanent("scripted", "invalid input"));
                }
            }
            Ok(Embedded {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                tokens: Some(texts.len() as u64),
            })
        }
    }

    fn settings(batch_size: usize, max_concurrency: usize, max_retries: u32) -> BatchSettings {
        BatchSettings {
            batch_size,
            max_concurrency,
            max_retries,
            retry_base: Duration::from_millis(1),
        }
    }

    fn note(path: &str, texts: &[&str]) -> NoteChunks {
        NoteChunks {
            note_path: path.to_string(),
            chunks: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Chunk {
                    note_path: path.to_string(),
                    ordinal: i,
                    text: t.to_string(),
                    span_start: 0,
                    span_end: t.len(),
                    heading_path: Vec::new(),
                    folder: String::new(),
                    title: path.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_partitions_and_bounds_concurrency() {
        let provider = Arc::new(ScriptedEmbedder::new(0, None));
        let batcher = EmbeddingBatcher::new(provider.clone(), settings(2, 2, 0));
        let notes = vec![
            note("a.md", &["a0", "a1", "a2"]),
            note("b.md", &["b0", "b1", "b2", "b3"]),
        ];

        let outcome = batcher.embed_notes(notes).await;
        assert_eq!(outcome.embedded.len(), 2);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.tokens, 7);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(provider.batch_sizes.lock().unwrap().iter().all(|&n| n <= 2));
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);

        let b = &outcome.embedded[1];
        assert_eq!(b.note_path, "b.md");
        let ordinals: Vec<usize> = b.vectors.iter().map(|v| v.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let provider = Arc::new(ScriptedEmbedder::new(2, None));
        let batcher = EmbeddingBatcher::new(provider.clone(), settings(10, 1, 3));

        let outcome = batcher.embed_notes(vec![note("a.md", &["x"])]).await;
        assert_eq!(outcome.embedded.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fail_note() {
        let provider = Arc::new(ScriptedEmbedder::new(usize::MAX, None));
        let batcher = EmbeddingBatcher::new(provider.clone(), settings(10, 1, 2));

        let outcome = batcher.embed_notes(vec![note("a.md", &["x"])]).await;
        assert!(outcome.embedded.is_empty());
        assert_eq!(outcome.failed[0].note_path, "a.md");
        assert!(outcome.failed[0].reason.contains("rate limited"));
        // initial attempt + 2 retries
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.tokens, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_isolated_to_batch() {
        let provider = Arc::new(ScriptedEmbedder::new(0, Some("poison")));
        let batcher = EmbeddingBatcher::new(provider.clone(), settings(1, 4, 5));
        let notes = vec![
            note("good.md", &["fine", "also fine"]),
            note("bad.md", &["ok", "poison pill"]),
        ];

        let outcome = batcher.embed_notes(notes).await;
        assert_eq!(outcome.embedded.len(), 1);
        assert_eq!(outcome.embedded[0].note_path, "good.md");
        assert_eq!(
            outcome.failed,
            vec![FailedNote {
                note_path: "bad.md".to_string(),
                reason: "scripted: invalid input".to_string(),
            }]
        );
        // Permanent errors are not retried
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let provider = Arc::new(ScriptedEmbedder::new(0, None));
        let batcher = EmbeddingBatcher::new(provider.clone(), settings(4, 2, 0));
        let outcome = batcher.embed_notes(Vec::new()).await;
        assert!(outcome.embedded.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_delay_caps_exponent() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, 12), Duration::from_secs(32));
    }
}
