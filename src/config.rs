//! TOML configuration.
//!
//! A single file describes the vault, the SQLite database, chunking limits,
//! the embedding backend, retrieval bounds, model routing tiers and provider
//! credentials. Every section except `[vault]` and `[db]` has defaults.
//!
//! ```toml
//! [vault]
//! root = "/home/me/Notes"
//!
//! [db]
//! path = "./data/index.sqlite"
//!
//! [routing]
//! simple = { provider = "openai", model = "gpt-4o-mini" }
//! complex = { provider = "anthropic", model = "claude-3-5-sonnet-20241022" }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::pricing::ModelPrice;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Per-model price overrides, keyed by model name.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    /// Vault name used in `obsidian://` links. Defaults to the root directory name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl VaultConfig {
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "vault".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

/// Upper bound on chunks retrieved for one question.
pub const MAX_TOP_K: usize = 20;

fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_excerpt_chars() -> usize {
    300
}

/// A provider/model pair for one complexity tier.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TierConfig {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    #[serde(default = "default_simple_tier")]
    pub simple: TierConfig,
    #[serde(default = "default_complex_tier")]
    pub complex: TierConfig,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_complex_threshold")]
    pub complex_threshold: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            simple: default_simple_tier(),
            complex: default_complex_tier(),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            complex_threshold: default_complex_threshold(),
        }
    }
}

fn default_simple_tier() -> TierConfig {
    TierConfig {
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}
fn default_complex_tier() -> TierConfig {
    TierConfig {
        provider: "anthropic".to_string(),
        model: "claude-3-5-sonnet-20241022".to_string(),
    }
}
fn default_temperature() -> f32 {
    0.7
}
fn default_completion_tokens() -> u32 {
    4096
}
fn default_complex_threshold() -> u32 {
    2
}

/// Connection settings for one model provider.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderSettings {
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub anthropic: ProviderSettings,
    #[serde(default)]
    pub ollama: ProviderSettings,
}

impl ProvidersConfig {
    pub fn settings(&self, provider: &str) -> Option<&ProviderSettings> {
        match provider {
            "openai" => Some(&self.openai),
            "anthropic" => Some(&self.anthropic),
            "ollama" => Some(&self.ollama),
            _ => None,
        }
    }

    /// Resolve the API key for `provider` from its configured environment variable.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let default_env = match provider {
            "openai" => "OPENAI_API_KEY",
            "anthropic" => "ANTHROPIC_API_KEY",
            _ => return None,
        };
        let env = self
            .settings(provider)
            .and_then(|s| s.api_key_env.as_deref())
            .unwrap_or(default_env);
        std::env::var(env).ok().filter(|k| !k.is_empty())
    }

    pub fn base_url(&self, provider: &str) -> String {
        let default_url = match provider {
            "anthropic" => "https://api.anthropic.com",
            "ollama" => "http://localhost:11434",
            _ => "https://api.openai.com",
        };
        self.settings(provider)
            .and_then(|s| s.base_url.clone())
            .unwrap_or_else(|| default_url.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn timeout_secs(&self, provider: &str) -> u64 {
        self.settings(provider)
            .and_then(|s| s.timeout_secs)
            .unwrap_or(120)
    }
}

const CHAT_PROVIDERS: &[&str] = &["openai", "anthropic", "ollama"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate retrieval
    if !(1..=MAX_TOP_K).contains(&config.retrieval.top_k) {
        anyhow::bail!("retrieval.top_k must be in [1, {}]", MAX_TOP_K);
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_concurrency == 0 {
        anyhow::bail!("embedding.max_concurrency must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Validate routing
    for (tier, settings) in [
        ("simple", &config.routing.simple),
        ("complex", &config.routing.complex),
    ] {
        if !CHAT_PROVIDERS.contains(&settings.provider.as_str()) {
            anyhow::bail!(
                "Unknown provider for routing.{}: '{}'. Must be one of: {}",
                tier,
                settings.provider,
                CHAT_PROVIDERS.join(", ")
            );
        }
        if settings.model.trim().is_empty() {
            anyhow::bail!("routing.{}.model must not be empty", tier);
        }
    }
    if !(0.0..=2.0).contains(&config.routing.temperature) {
        anyhow::bail!("routing.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
