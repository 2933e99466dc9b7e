//! # docsync CLI
//!
//! The `docsync` binary runs the sync pipelines by hand, inspects run
//! history, queries class indexes, and starts the long-running service
//! (per-class timers plus the operator HTTP API).
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create the SQLite run log and schema |
//! | `docsync classes` | List configured document classes |
//! | `docsync sync <class>` | Run one class now (`--dry-run`, `--full`, `--since`) |
//! | `docsync runs` | Show recent runs |
//! | `docsync search <class> "<query>"` | Nearest neighbours in a class collection |
//! | `docsync serve` | Start the scheduler and operator API |
//!
//! Secrets are read from the environment; a `.env` file in the working
//! directory is loaded first. Logging is controlled by `RUST_LOG`.

use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use docsync::commands::{self, SyncArgs};
use docsync::config;
use docsync::progress::ProgressMode;

/// docsync: keep vector collections in step with shared-drive documents.
#[derive(Parser)]
#[command(
    name = "docsync",
    version,
    about = "Scheduled document-to-vector synchronization",
    long_about = "docsync polls Microsoft Graph drive folders, extracts text from \
    structured files, PDFs and spreadsheets, and upserts embeddings of changed records \
    into per-class Qdrant collections."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docsync.toml`.
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the run-log database.
    ///
    /// Creates the SQLite file and its tables. Safe to run repeatedly.
    Init,

    /// List configured document classes with defaults applied.
    Classes,

    /// Run one document class now.
    ///
    /// Uses the same per-class lock as the scheduler: if the class is
    /// already running in this process, the command fails without
    /// contacting any remote service.
    Sync {
        /// Class name from `[classes.<name>]`.
        class: String,

        /// Compute and embed, but write nothing to the vector store.
        #[arg(long)]
        dry_run: bool,

        /// Ignore the checkpoint and consider every file.
        #[arg(long)]
        full: bool,

        /// Only consider files modified on or after this date (YYYY-MM-DD).
        #[arg(long, value_parser = commands::parse_since)]
        since: Option<DateTime<Utc>>,

        /// Progress output on stderr.
        ///
        /// Defaults to `human` on a terminal and `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show recent runs, newest first.
    Runs {
        /// Only runs of this class.
        #[arg(long)]
        class: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Nearest-neighbour search in one class collection.
    Search {
        class: String,
        query: String,

        #[arg(long, default_value = "10")]
        top_k: usize,
    },

    /// Start per-class timers and the operator HTTP API.
    ///
    /// Runs until Ctrl+C or SIGTERM.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Classes => {
            commands::list_classes(&cfg);
        }
        Commands::Sync {
            class,
            dry_run,
            full,
            since,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_sync(
                &cfg,
                SyncArgs {
                    class,
                    dry_run,
                    full,
                    since,
                    progress,
                },
            )
            .await?;
        }
        Commands::Runs { class, limit } => {
            commands::list_runs(&cfg, class.as_deref(), limit).await?;
        }
        Commands::Search {
            class,
            query,
            top_k,
        } => {
            commands::run_search(&cfg, &class, &query, top_k).await?;
        }
        Commands::Serve => {
            commands::serve(&cfg, shutdown_signal()).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = {
        use tokio::signal::unix::{signal, SignalKind};

        let installed = signal(SignalKind::terminate()).map(|mut stream| async move {
            stream.recv().await;
        });
        signal_or_pending("SIGTERM", installed)
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Wait for an installed signal. If installing the handler failed, log it
/// and never resolve, so the other shutdown triggers still apply.
#[cfg_attr(not(unix), allow(dead_code))]
async fn signal_or_pending<F: Future>(name: &str, installed: std::io::Result<F>) {
    match installed {
        Ok(received) => {
            received.await;
        }
        Err(err) => {
            warn!(error = %err, signal = name, "failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
