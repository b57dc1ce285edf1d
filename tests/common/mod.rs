#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use vault_qa::config::{self, Config};
use vault_qa::db::connect_path;
use vault_qa::embedding::{Embedded, EmbeddingProvider};
use vault_qa::error::ProviderError;
use vault_qa::ledger::Ledger;
use vault_qa::llm::{ChatModel, ChatRequest, Completion};
use vault_qa::migrate::run_migrations;
use vault_qa::models::{ChunkVector, RetrievedChunk, SyncMode};
use vault_qa::progress::NoProgress;
use vault_qa::store::memory::InMemoryVectorIndex;
use vault_qa::store::{FolderFilter, VectorIndex};
use vault_qa::sync::{SyncResult, SyncService};

pub const DIMS: usize = 32;
pub const EMBED_MODEL: &str = "hash-embed";

/// Bag-of-words vector: each lowercase word bumps one hashed bucket.
pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let h = word
            .to_lowercase()
            .bytes()
            .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        v[(h as usize) % DIMS] += 1.0;
    }
    v
}

/// Deterministic embedder. Texts containing `fail_marker` fail permanently;
/// with a gate, every call waits for a permit first.
#[derive(Default)]
pub struct HashEmbedder {
    pub calls: AtomicUsize,
    pub fail_marker: Mutex<Option<String>>,
    pub gate: Option<Arc<Semaphore>>,
    pub entered: Arc<tokio::sync::Notify>,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_on(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn provider_name(&self) -> &str {
        "hash"
    }
    fn model_name(&self) -> &str {
        EMBED_MODEL
    }
    fn dims(&self) -> Option<usize> {
        Some(DIMS)
    }

    async fn embed(&self, texts: &[String]) -> Result<Embedded, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        let marker = self.fail_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if texts.iter().any(|t| t.contains(&marker)) {
                return Err(ProviderError::permanent("hash", "refused input"));
            }
        }
        let tokens = texts.iter().map(|t| t.split_whitespace().count() as u64).sum();
        Ok(Embedded {
            vectors: texts.iter().map(|t| hash_vector(t)).collect(),
            tokens: Some(tokens),
        })
    }
}

/// Wraps the harness index; writes and deletes for `fail_key` error out
/// before reaching the inner index.
pub struct FlakyIndex {
    pub inner: Arc<InMemoryVectorIndex>,
    pub fail_key: Mutex<Option<String>>,
}

impl FlakyIndex {
    pub fn new(inner: Arc<InMemoryVectorIndex>) -> Self {
        Self {
            inner,
            fail_key: Mutex::new(None),
        }
    }

    pub fn fail_on(&self, note_key: &str) {
        *self.fail_key.lock().unwrap() = Some(note_key.to_string());
    }

    fn refuses(&self, note_key: &str) -> bool {
        self.fail_key.lock().unwrap().as_deref() == Some(note_key)
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn upsert(&self, note_key: &str, vectors: &[ChunkVector]) -> anyhow::Result<()> {
        if self.refuses(note_key) {
            anyhow::bail!("simulated write failure for {}", note_key);
        }
        self.inner.upsert(note_key, vectors).await
    }

    async fn delete(&self, note_key: &str) -> anyhow::Result<()> {
        if self.refuses(note_key) {
            anyhow::bail!("simulated delete failure for {}", note_key);
        }
        self.inner.delete(note_key).await
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &FolderFilter,
    ) -> anyhow::Result<Vec<RetrievedChunk>> {
        self.inner.search(query, k, filter).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.inner.clear().await
    }

    async fn note_keys(&self) -> anyhow::Result<HashSet<String>> {
        self.inner.note_keys().await
    }

    async fn count(&self) -> anyhow::Result<usize> {
        self.inner.count().await
    }
}

/// Chat model that replays fixed deltas and records what it was asked.
pub struct ScriptedChat {
    pub provider: String,
    pub model: String,
    pub deltas: Vec<String>,
    /// Fail with a transient error before sending the delta at this index.
    pub fail_at: Option<usize>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub sent: AtomicUsize,
    pub finished: AtomicBool,
}

impl ScriptedChat {
    pub fn new(provider: &str, model: &str, deltas: &[&str]) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_at: None,
            requests: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn last_prompt(&self) -> String {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|r| r.prompt.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn provider(&self) -> &str {
        &self.provider
    }
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_at.is_some() {
            return Err(ProviderError::transient(&self.provider, "scripted failure"));
        }
        Ok(Completion {
            text: self.deltas.concat(),
            input_tokens: 100,
            output_tokens: self.deltas.len() as u64,
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut text = String::new();
        for (i, delta) in self.deltas.iter().enumerate() {
            if self.fail_at == Some(i) {
                self.finished.store(true, Ordering::SeqCst);
                return Err(ProviderError::transient(&self.provider, "connection reset mid-stream"));
            }
            if tx.send(delta.clone()).await.is_err() {
                break;
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            text.push_str(delta);
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(Completion {
            text,
            input_tokens: 100,
            output_tokens: self.sent.load(Ordering::SeqCst) as u64,
        })
    }
}

pub fn test_config(root: &Path) -> Config {
    let toml_str = format!(
        r#"
[vault]
root = "{root}/vault"
name = "Test Vault"

[db]
path = "{root}/data/index.sqlite"

[chunking]
max_tokens = 60
overlap_tokens = 10

[embedding]
provider = "ollama"
model = "{model}"
batch_size = 4
max_concurrency = 2
max_retries = 1
retry_base_ms = 1
"#,
        root = root.display(),
        model = EMBED_MODEL,
    );
    let cfg: Config = toml::from_str(&toml_str).unwrap();
    config::validate(&cfg).unwrap();
    cfg
}

/// A vault on disk, a migrated ledger and an in-memory vector index.
pub struct Harness {
    pub tmp: TempDir,
    pub vault: PathBuf,
    pub config: Config,
    pub ledger: Ledger,
    pub index: Arc<InMemoryVectorIndex>,
    pub embedder: Arc<HashEmbedder>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_embedder(HashEmbedder::new()).await
    }

    pub async fn with_embedder(embedder: HashEmbedder) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let vault = config.vault.root.clone();
        fs::create_dir_all(&vault).unwrap();

        let pool = connect_path(&config.db.path).await.unwrap();
        run_migrations(&pool).await.unwrap();

        Self {
            tmp,
            vault,
            config,
            ledger: Ledger::new(pool),
            index: Arc::new(InMemoryVectorIndex::new()),
            embedder: Arc::new(embedder),
        }
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.vault.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn write_bytes(&self, rel: &str, bytes: &[u8]) {
        fs::write(self.vault.join(rel), bytes).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.vault.join(rel)).unwrap();
    }

    pub fn sync_service(&self) -> SyncService {
        SyncService::new(
            &self.config,
            self.embedder.clone(),
            self.index.clone(),
            self.ledger.clone(),
        )
    }

    /// Sync service writing through `index` instead of the harness index.
    pub fn sync_service_with_index(&self, index: Arc<dyn VectorIndex>) -> SyncService {
        SyncService::new(&self.config, self.embedder.clone(), index, self.ledger.clone())
    }

    /// A [`FlakyIndex`] over the harness index.
    pub fn flaky_index(&self) -> Arc<FlakyIndex> {
        Arc::new(FlakyIndex::new(self.index.clone()))
    }

    pub async fn sync(&self) -> SyncResult {
        self.sync_mode(SyncMode::Incremental).await
    }

    pub async fn sync_mode(&self, mode: SyncMode) -> SyncResult {
        self.sync_service()
            .run(mode, &NoProgress, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Three notes across two folders.
    pub fn seed_three_notes(&self) {
        self.write(
            "garden.md",
            "# Garden\n\nTomatoes need full sun and deep watering twice a week.\n",
        );
        self.write(
            "Travel/lisbon.md",
            "---\ntitle: Lisbon Trip\n---\n# Lisbon\n\nTram 28 climbs to the castle. Pastel de nata at Belem.\n",
        );
        self.write(
            "Work/roadmap.md",
            "# Roadmap\n\n## Q3\n\nShip the billing migration and retire the legacy invoices service.\n",
        );
    }
}
