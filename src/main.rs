//! # Report Chat CLI (`report-chat`)
//!
//! Ingests PDF reports into a vector index and answers questions about them,
//! from the terminal or over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! report-chat --config ./config/report-chat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `report-chat init` | Create the record and vector store schemas |
//! | `report-chat ingest` | Load, chunk, and reconcile all reports into the index |
//! | `report-chat pages` | Print page counts per report |
//! | `report-chat status` | Reports, metadata coverage, and index counts |
//! | `report-chat ask "<question>"` | Answer one question on the terminal |
//! | `report-chat eval <csv>` | Run a question set and score the answers |
//! | `report-chat serve` | Start the HTTP chat service |
//!
//! Environment variables (also read from `.env`) override the config file;
//! see `config::apply_env_overrides`. Logging is controlled by `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use report_chat_core::index::CleanupMode;
use report_chat::{ask, config, eval, ingest, migrate, pages, server, status};

/// Report Chat: retrieval-augmented question answering over PDF reports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/report-chat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "report-chat",
    about = "Report Chat: question answering over a folder of PDF reports",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/report-chat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the record store and vector store schemas. Idempotent.
    Init,

    /// Load every report, chunk it, and reconcile the index.
    ///
    /// Unchanged pages are skipped, changed pages are replaced, and in
    /// `full` cleanup mode pages that no longer exist are removed.
    Ingest {
        /// Cleanup mode: `full` or `incremental`. Defaults to `[ingest].cleanup`.
        #[arg(long)]
        cleanup: Option<CleanupMode>,

        /// Show what would change without embedding or writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the page count of each report and the total.
    Pages,

    /// Show reports found, metadata coverage, and index counts.
    Status,

    /// Answer a single question and list its sources.
    Ask {
        /// The question to answer.
        question: String,
    },

    /// Run every `Question` row of a CSV through the pipeline.
    Eval {
        /// Path to the CSV question set.
        csv: PathBuf,
    },

    /// Start the HTTP chat service on `[server].bind`.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Stores initialized successfully.");
        }
        Commands::Ingest { cleanup, dry_run } => {
            ingest::run_ingest(&cfg, cleanup, dry_run).await?;
        }
        Commands::Pages => {
            pages::run_pages(&cfg)?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Ask { question } => {
            ask::run_ask(&cfg, &question).await?;
        }
        Commands::Eval { csv } => {
            eval::run_eval(&cfg, &csv).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
