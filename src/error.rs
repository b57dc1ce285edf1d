//! Error taxonomy for indexing and querying.
//!
//! [`ProviderError`] classifies a single call to an embedding or model
//! backend so callers can decide whether to retry. [`VaultError`] covers
//! everything the sync and query orchestrators can surface.

use thiserror::Error;

/// Outcome classification for a failed provider call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or 5xx. Safe to retry.
    #[error("{provider}: transient error: {message}")]
    Transient { provider: String, message: String },

    /// Authentication failure, invalid request or malformed response.
    #[error("{provider}: {message}")]
    Permanent { provider: String, message: String },

    #[error("provider '{0}' is not configured")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Classify an HTTP error status: 429 and 5xx are transient, other 4xx are not.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("API error {}: {}", status, truncate(body, 500));
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderError::transient(provider, message)
        } else {
            ProviderError::permanent(provider, message)
        }
    }

    /// Connection errors and timeouts are transient; body decoding errors are not.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::permanent(provider, format!("invalid response: {}", err))
        } else {
            ProviderError::transient(provider, err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("provider unavailable: {0}")]
    TransientProvider(ProviderError),

    #[error("provider error: {0}")]
    PermanentProvider(ProviderError),

    #[error("cannot read note {path}: {message}")]
    CorpusRead { path: String, message: String },

    #[error("index inconsistency for {path}: {message}")]
    IndexConsistency { path: String, message: String },

    #[error("sync already in progress")]
    ConcurrencyConflict,

    #[error("vault root does not exist: {0}")]
    MissingVault(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ProviderError> for VaultError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            VaultError::TransientProvider(err)
        } else {
            VaultError::PermanentProvider(err)
        }
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
