//! CLI command handlers.
//!
//! Each `run_*` function loads what it needs from [`Config`], does the work
//! through the library services, and prints results to stdout. Progress and
//! diagnostics go to stderr.

use anyhow::{bail, Result};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::ledger::Ledger;
use crate::llm::ProviderFactory;
use crate::migrate::run_migrations;
use crate::models::SyncMode;
use crate::progress::{format_number, ProgressMode};
use crate::query::{QueryEvent, QueryRequest, QueryService};
use crate::router::{Complexity, ModelRouter};
use crate::scanner::{scan_vault, ScanReport};
use crate::store::sqlite::SqliteVectorIndex;
use crate::store::{FolderFilter, VectorIndex};
use crate::sync::{index_status, SyncService};

struct Storage {
    ledger: Ledger,
    index: Arc<SqliteVectorIndex>,
}

/// Open the index database, creating the schema if needed.
async fn open_storage(cfg: &Config) -> Result<Storage> {
    let pool = db::connect(cfg).await?;
    run_migrations(&pool).await?;
    Ok(Storage {
        ledger: Ledger::new(pool.clone()),
        index: Arc::new(SqliteVectorIndex::new(pool)),
    })
}

fn query_service(cfg: &Config, storage: &Storage) -> Result<QueryService> {
    let embedder = create_embedder(cfg)?;
    let models = Arc::new(ProviderFactory::new(cfg.providers.clone()));
    Ok(QueryService::new(cfg, embedder, storage.index.clone(), models))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_init(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    run_migrations(&pool).await?;
    println!("Database initialized at {}.", cfg.db.path.display());
    Ok(())
}

pub async fn run_status(cfg: &Config, json: bool) -> Result<()> {
    let storage = open_storage(cfg).await?;
    let status = index_status(&cfg.vault, &storage.ledger, &cfg.embedding.model).await?;
    let vectors = storage.index.count().await?;

    if json {
        let mut value = serde_json::to_value(&status)?;
        value["chunk_vectors"] = serde_json::json!(vectors);
        return print_json(&value);
    }

    let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    };
    println!("vault {}", cfg.vault.root.display());
    println!("  notes: {}", format_number(status.total_notes as u64));
    println!("  indexed: {}", format_number(status.indexed_notes as u64));
    println!("  pending: {}", format_number(status.pending_notes as u64));
    println!("  deleted: {}", format_number(status.deleted_notes as u64));
    if status.unreadable_notes > 0 {
        println!("  unreadable: {}", status.unreadable_notes);
    }
    println!("  chunk vectors: {}", format_number(vectors as u64));
    println!("  embedding model: {}", status.embedding_model);
    println!("  last full sync: {}", when(status.last_full_sync));
    println!("  last incremental sync: {}", when(status.last_incremental_sync));
    Ok(())
}

pub async fn run_sync(
    cfg: &Config,
    full: bool,
    progress: Option<ProgressMode>,
    json: bool,
) -> Result<()> {
    if !cfg.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config to sync.");
    }
    let storage = open_storage(cfg).await?;
    let embedder = create_embedder(cfg)?;
    let service = SyncService::new(cfg, embedder, storage.index.clone(), storage.ledger.clone());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; finishing the current note");
            on_interrupt.cancel();
        }
    });

    let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let result = service.run(mode, reporter.as_ref(), &cancel).await?;

    if json {
        return print_json(&result);
    }

    println!("sync {}", result.mode);
    println!("  added: {}", result.notes_added);
    println!("  updated: {}", result.notes_updated);
    println!("  deleted: {}", result.notes_deleted);
    println!("  unchanged: {}", result.notes_unchanged);
    println!("  chunks created: {}", format_number(result.chunks_created as u64));
    println!(
        "  embedding tokens: {} (${:.6})",
        format_number(result.embedding_tokens_used),
        result.embedding_cost
    );
    println!("  duration: {:.1}s", result.duration_seconds);
    if result.has_failures() {
        println!("  failed: {}", result.failures.len());
        for failure in &result.failures {
            println!("    {}: {}", failure.note_path, failure.reason);
        }
    }
    if result.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }
    Ok(())
}

pub struct AskOptions {
    pub folders: Vec<String>,
    pub complexity: Complexity,
    pub top_k: Option<usize>,
    pub json: bool,
    pub no_stream: bool,
}

pub async fn run_ask(cfg: &Config, question: &str, opts: AskOptions) -> Result<()> {
    let storage = open_storage(cfg).await?;
    let service = query_service(cfg, &storage)?;
    let request = QueryRequest {
        question: question.to_string(),
        complexity: opts.complexity,
        folders: opts.folders,
        top_k: opts.top_k,
    };

    if opts.no_stream {
        let response = service.answer(request).await?;
        if opts.json {
            return print_json(&response);
        }
        println!("{}", response.answer);
        print_sources(&response.sources);
        println!(
            "\n[{} via {} | {} in / {} out tokens | ${:.6} | {} ms]",
            response.metadata.model_used,
            response.metadata.complexity_used,
            response.metadata.input_tokens,
            response.metadata.output_tokens,
            response.metadata.total_cost,
            response.metadata.latency_ms
        );
        return Ok(());
    }

    let mut events = service.stream(request);
    let mut stdout = std::io::stdout();
    let mut sources = Vec::new();
    while let Some(event) = events.recv().await {
        if opts.json {
            println!("{}", serde_json::to_string(&event)?);
            if let QueryEvent::Error { error } = &event {
                bail!("{}", error);
            }
            continue;
        }
        match event {
            QueryEvent::Sources { sources: refs } => sources = refs,
            QueryEvent::Content { content } => {
                print!("{}", content);
                stdout.flush()?;
            }
            QueryEvent::Metadata(meta) => {
                println!();
                print_sources(&sources);
                println!(
                    "\n[{} via {} | {} in / {} out tokens | ${:.6} | {} ms]",
                    meta.model_used,
                    meta.complexity_used,
                    meta.input_tokens,
                    meta.output_tokens,
                    meta.total_cost,
                    meta.latency_ms
                );
            }
            QueryEvent::Error { error } => {
                println!();
                bail!("{}", error);
            }
            QueryEvent::Done => break,
        }
    }
    Ok(())
}

fn print_sources(sources: &[crate::query::NoteReference]) {
    if sources.is_empty() {
        println!("\nNo sources.");
        return;
    }
    println!("\nSources:");
    for (i, source) in sources.iter().enumerate() {
        println!(
            "  {}. {} ({}) score {:.3}",
            i + 1,
            source.title,
            source.note_path,
            source.similarity_score
        );
        println!("     {}", source.obsidian_url);
    }
}

pub async fn run_search(
    cfg: &Config,
    query: &str,
    folders: Vec<String>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(cfg).await?;
    let service = query_service(cfg, &storage)?;
    let limit = limit.unwrap_or(cfg.retrieval.top_k);
    let hits = service.search(query, &folders, limit).await?;

    if json {
        return print_json(&hits);
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let section = hit.heading().map(|h| format!(" > {}", h)).unwrap_or_default();
        println!("{}. [{:.3}] {}{}", i + 1, hit.score, hit.note_path, section);
        println!("    folder: {}", if hit.folder.is_empty() { "/" } else { &hit.folder });
        println!("    chunk: {}", hit.ordinal);
        println!("    {}", crate::query::excerpt(&hit.text, 160).replace('\n', " "));
        println!();
    }
    Ok(())
}

fn scan_for_listing(cfg: &Config) -> Result<ScanReport> {
    let report = scan_vault(&cfg.vault)?;
    if !report.unreadable.is_empty() {
        eprintln!("warning: {} unreadable note(s) skipped", report.unreadable.len());
    }
    Ok(report)
}

#[derive(serde::Serialize)]
struct FolderItem {
    name: String,
    notes: usize,
}

/// List the vault's top-level folders, the valid `--folder` scopes.
pub fn run_folders(cfg: &Config, json: bool) -> Result<()> {
    let folders: Vec<FolderItem> = scan_for_listing(cfg)?
        .top_level_folders()
        .into_iter()
        .map(|(name, notes)| FolderItem { name, notes })
        .collect();

    if json {
        return print_json(&serde_json::json!({
            "folders": folders,
            "total": folders.len(),
        }));
    }
    if folders.is_empty() {
        println!("No folders.");
        return Ok(());
    }
    for folder in &folders {
        println!("{} ({})", folder.name, format_number(folder.notes as u64));
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct NoteItem<'a> {
    path: &'a str,
    title: &'a str,
    folder: &'a str,
    modified: chrono::DateTime<chrono::Utc>,
}

pub fn run_notes(
    cfg: &Config,
    folder: Option<String>,
    offset: usize,
    limit: usize,
    json: bool,
) -> Result<()> {
    if limit == 0 {
        bail!("--limit must be at least 1");
    }
    let report = scan_for_listing(cfg)?;
    let filter = FolderFilter::new(folder.iter());
    let matching = report.newest_first(&filter);
    let total = matching.len();
    let page: Vec<NoteItem> = matching
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|note| NoteItem {
            path: &note.path,
            title: &note.title,
            folder: &note.folder,
            modified: note.modified,
        })
        .collect();

    if json {
        return print_json(&serde_json::json!({
            "notes": page,
            "total": total,
            "offset": offset,
            "limit": limit,
        }));
    }
    if page.is_empty() {
        println!("No notes.");
        return Ok(());
    }
    for note in &page {
        println!(
            "{}  {}  ({})",
            note.modified.format("%Y-%m-%d %H:%M"),
            note.path,
            note.title
        );
    }
    if offset + page.len() < total {
        println!(
            "showing {}-{} of {}",
            offset + 1,
            offset + page.len(),
            format_number(total as u64)
        );
    }
    Ok(())
}

pub fn run_route(cfg: &Config, question: &str, complexity: Complexity, json: bool) -> Result<()> {
    let router = ModelRouter::new(&cfg.routing);
    let decision = router.resolve(question, complexity);
    if json {
        return print_json(&decision);
    }
    println!("route {}/{}", decision.provider, decision.model);
    if decision.overridden {
        println!("  tier: {} (forced)", decision.tier);
    }
    print!("  {}", router.analyzer().explain(question).replace('\n', "\n  ").trim_end());
    println!();
    Ok(())
}
