//! # Vault QA CLI (`vqa`)
//!
//! ## Usage
//!
//! ```bash
//! vqa --config ./config/vqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vqa init` | Create the SQLite database and run schema migrations |
//! | `vqa status` | Show indexed, pending and deleted note counts |
//! | `vqa sync` | Index new and changed notes, drop deleted ones |
//! | `vqa sync --full` | Clear the index and re-embed every note |
//! | `vqa ask "<question>"` | Stream a grounded answer with sources |
//! | `vqa search "<query>"` | Show the nearest chunks without calling a model |
//! | `vqa route "<question>"` | Show which model tier a question routes to |
//! | `vqa folders` | List top-level folders, the valid `--folder` scopes |
//! | `vqa notes --folder Work` | List notes, newest first |
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=vault_qa=debug`) or pass `--verbose` for
//! diagnostics on stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vault_qa::commands::{self, AskOptions};
use vault_qa::config;
use vault_qa::progress::ProgressMode;
use vault_qa::router::Complexity;

/// Vault QA: incremental indexing and grounded Q&A over markdown notes.
#[derive(Parser)]
#[command(
    name = "vqa",
    about = "Incremental indexing and grounded question answering over a markdown vault",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vqa.toml")]
    config: PathBuf,

    /// Info-level logging on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Compare the vault with the index and show what is pending.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Bring the index up to date with the vault.
    ///
    /// Only new, changed and deleted notes are processed unless `--full`
    /// is given. Press Ctrl-C to stop after the current note; notes
    /// already written stay indexed.
    Sync {
        /// Clear the index and ledger, then embed every note.
        #[arg(long)]
        full: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question about your notes.
    Ask {
        question: String,

        /// Restrict retrieval to a folder and its subfolders. Repeatable.
        #[arg(long = "folder")]
        folders: Vec<String>,

        #[arg(long, value_enum, default_value = "auto")]
        complexity: Complexity,

        /// Number of chunks to retrieve (1-20).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print one JSON event per line.
        #[arg(long)]
        json: bool,

        /// Wait for the full answer instead of streaming.
        #[arg(long)]
        no_stream: bool,
    },

    /// Retrieve the nearest chunks for a query.
    Search {
        query: String,

        #[arg(long = "folder")]
        folders: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Explain how a question would be routed.
    Route {
        question: String,

        #[arg(long, value_enum, default_value = "auto")]
        complexity: Complexity,

        #[arg(long)]
        json: bool,
    },

    /// List top-level folders with their note counts.
    Folders {
        #[arg(long)]
        json: bool,
    },

    /// List notes, most recently modified first.
    Notes {
        /// Only notes in this folder or beneath it.
        #[arg(long)]
        folder: Option<String>,

        /// Notes to skip before the first one shown.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "vault_qa=info" } else { "vault_qa=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Status { json } => {
            commands::run_status(&cfg, json).await?;
        }
        Commands::Sync {
            full,
            progress,
            json,
        } => {
            commands::run_sync(&cfg, full, progress, json).await?;
        }
        Commands::Ask {
            question,
            folders,
            complexity,
            top_k,
            json,
            no_stream,
        } => {
            let opts = AskOptions {
                folders,
                complexity,
                top_k,
                json,
                no_stream,
            };
            commands::run_ask(&cfg, &question, opts).await?;
        }
        Commands::Search {
            query,
            folders,
            limit,
            json,
        } => {
            commands::run_search(&cfg, &query, folders, limit, json).await?;
        }
        Commands::Route {
            question,
            complexity,
            json,
        } => {
            commands::run_route(&cfg, &question, complexity, json)?;
        }
        Commands::Folders { json } => {
            commands::run_folders(&cfg, json)?;
        }
        Commands::Notes {
            folder,
            offset,
            limit,
            json,
        } => {
            commands::run_notes(&cfg, folder, offset, limit, json)?;
        }
    }

    Ok(())
}
