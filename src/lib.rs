//! # Vault QA
//!
//! Incremental indexing and grounded question answering over a vault of
//! markdown notes.
//!
//! Sync walks the vault, compares each note's content fingerprint with the
//! ledger, and re-embeds only what changed. Queries embed the question,
//! retrieve the nearest chunks inside an optional folder scope, and stream an
//! answer from a model picked by question complexity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Scanner  │──▶│  Change  │──▶│  Chunker +  │──▶│ Vector index │
//! │ (vault)  │   │ detector │   │  Embedder   │   │   + Ledger   │
//! └──────────┘   └──────────┘   └─────────────┘   └──────┬───────┘
//!                                                        │ search
//!                ┌──────────┐   ┌─────────────┐   ┌──────▼───────┐
//!   question ──▶ │  Router  │──▶│ Chat model  │◀──│    Query     │──▶ events
//!                └──────────┘   └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vqa init                          # create database
//! vqa sync                          # index new and changed notes
//! vqa ask "What did I decide about the roof?"
//! vqa ask "Compare my Q1 and Q2 retros" --folder Work
//! vqa status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`scanner`] | Vault walk and note fingerprints |
//! | [`diff`] | Change detection against the ledger |
//! | [`chunk`] | Heading-aware text chunking |
//! | [`embedding`] | Embedding providers and the batcher |
//! | [`store`] | Vector index trait, SQLite and in-memory backends |
//! | [`ledger`] | Per-note index ledger and sync timestamps |
//! | [`sync`] | Sync orchestrator |
//! | [`router`] | Complexity analysis and model routing |
//! | [`llm`] | Chat model providers |
//! | [`query`] | Streaming query orchestrator |
//! | [`pricing`] | Token pricing |
//! | [`progress`] | Sync progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`commands`] | CLI command handlers |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pricing;
pub mod progress;
pub mod query;
pub mod router;
pub mod scanner;
pub mod store;
pub mod sync;
