//! CLI command implementations.
//!
//! Each `docsync` subcommand maps to one function here. Output meant for
//! people goes to stdout; logs and progress go to stderr.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use docsync_core::run::{Outcome, PipelineRun, RunOutcome, Trigger};

use crate::classes::ClassKind;
use crate::config::{Config, ExtractionMode};
use crate::ingest::{SyncOptions, SyncWindow};
use crate::pipelines::{build_pipeline, build_pipelines, graph_client, open_run_log};
use crate::progress::{NoProgress, ProgressMode};
use crate::runlog::RunLog;
use crate::scheduler::RunScheduler;
use crate::server;

/// `docsync init`: create the database and schema.
pub async fn run_init(cfg: &Config) -> Result<()> {
    open_run_log(cfg).await?;
    println!("Database initialized at {}.", cfg.db.path.display());
    Ok(())
}

/// `docsync classes`: print every configured class after defaults apply.
pub fn list_classes(cfg: &Config) {
    println!(
        "{:<14} {:<11} {:<24} {:<16} {:>8} {:>7}  EXTRACTION",
        "CLASS", "KIND", "FOLDER", "COLLECTION", "INTERVAL", "OFFSET"
    );
    for class in cfg.class_settings() {
        let extraction = match (class.kind, class.extraction) {
            (ClassKind::Regulation, _) => "structured",
            (ClassKind::CaseArchive, _) => "spreadsheet",
            (_, ExtractionMode::Ocr) => "ocr",
            (_, ExtractionMode::TextLayer) => "text_layer",
        };
        println!(
            "{:<14} {:<11} {:<24} {:<16} {:>7}m {:>6}m  {}",
            class.name,
            class.kind.as_str(),
            class.folder,
            class.collection,
            class.interval.as_secs() / 60,
            class.start_offset.as_secs() / 60,
            extraction
        );
    }
}

/// Parse a `--since` date (`YYYY-MM-DD`) as midnight UTC.
pub fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("invalid --since date '{}', expected YYYY-MM-DD", value))
}

pub struct SyncArgs {
    pub class: String,
    pub dry_run: bool,
    pub full: bool,
    pub since: Option<DateTime<Utc>>,
    pub progress: ProgressMode,
}

/// `docsync sync <class>`: one run through the same locked path the
/// scheduler uses. Fails when the run aborts.
pub async fn run_sync(cfg: &Config, args: SyncArgs) -> Result<()> {
    let settings = cfg
        .class(&args.class)
        .ok_or_else(|| anyhow!("unknown document class: '{}'", args.class))?;
    let window = match (args.since, args.full) {
        (Some(_), true) => bail!("--since and --full are mutually exclusive"),
        (Some(since), false) => SyncWindow::Since(since),
        (None, true) => SyncWindow::Full,
        (None, false) => SyncWindow::Checkpoint,
    };

    let run_log: Arc<dyn RunLog> = Arc::new(open_run_log(cfg).await?);
    let pipeline = build_pipeline(
        settings,
        graph_client(cfg)?,
        Arc::clone(&run_log),
        args.progress.reporter(),
    )?;
    let scheduler = RunScheduler::new(vec![Arc::new(pipeline)], run_log);

    let options = SyncOptions {
        dry_run: args.dry_run,
        window,
    };
    let run = scheduler
        .trigger_now(&args.class, Trigger::Manual, options)
        .await?;
    print_run(&run);

    if run.outcome == RunOutcome::Aborted {
        bail!(
            "run {} aborted: {}",
            run.id,
            run.abort_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("sync {} ({})", run.class, run.mode);
    println!("  run:               {}", run.id);
    println!("  outcome:           {}", run.outcome);
    if let Some(start) = run.window_start {
        println!("  window start:      {}", start.to_rfc3339());
    }
    println!("  fetched:           {}", run.counts.fetched);
    if run.mode.is_dry_run() {
        println!("  would upsert:      {}", run.counts.would_upsert);
    } else {
        println!("  upserted:          {}", run.counts.upserted);
    }
    println!("  skipped unchanged: {}", run.counts.skipped_unchanged);
    println!("  failed:            {}", run.counts.failed);
    for outcome in &run.outcomes {
        if let Outcome::Failed { kind, reason } = &outcome.outcome {
            println!(
                "    - {} ({}): {}: {}",
                outcome.key,
                outcome.source,
                kind.as_str(),
                reason
            );
        }
    }
    for error in &run.listing_errors {
        println!("    - listing: {}", error);
    }
    if run.advances_checkpoint {
        println!("  checkpoint:        {}", run.started_at.to_rfc3339());
    }
}

/// `docsync runs`: recent run history, newest first.
pub async fn list_runs(cfg: &Config, class: Option<&str>, limit: usize) -> Result<()> {
    if let Some(class) = class {
        if cfg.class(class).is_none() {
            bail!("unknown document class: '{}'", class);
        }
    }
    let run_log = open_run_log(cfg).await?;
    let runs = run_log.recent(class, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<36} {:<12} {:<9} {:<9} {:<15} {:>7} {:>8} {:>7} {:>6}  STARTED",
        "RUN", "CLASS", "TRIGGER", "MODE", "OUTCOME", "FETCHED", "UPSERTS", "SKIPPED", "FAILED"
    );
    for run in runs {
        let upserts = if run.mode.is_dry_run() {
            run.counts.would_upsert
        } else {
            run.counts.upserted
        };
        println!(
            "{:<36} {:<12} {:<9} {:<9} {:<15} {:>7} {:>8} {:>7} {:>6}  {}",
            run.id,
            run.class,
            run.trigger,
            run.mode,
            run.outcome,
            run.counts.fetched,
            upserts,
            run.counts.skipped_unchanged,
            run.counts.failed,
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// `docsync search <class> <query>`: nearest neighbours in a class index.
pub async fn run_search(cfg: &Config, class: &str, query: &str, top_k: usize) -> Result<()> {
    let settings = cfg
        .class(class)
        .ok_or_else(|| anyhow!("unknown document class: '{}'", class))?;
    let run_log: Arc<dyn RunLog> = Arc::new(open_run_log(cfg).await?);
    let pipeline = build_pipeline(settings, graph_client(cfg)?, run_log, Arc::new(NoProgress))?;

    let hits = pipeline.search(query, top_k).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let field = |name: &str| {
            hit.payload
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        println!(
            "{}. [{:.3}] {}  {}",
            i + 1,
            hit.score,
            field("key"),
            field("name")
        );
        let url = field("web_url");
        if !url.is_empty() {
            println!("    {}", url);
        }
    }
    Ok(())
}

/// `docsync serve`: timers plus the operator API until `shutdown` resolves.
pub async fn serve(cfg: &Config, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let run_log = open_run_log(cfg).await?;
    let abandoned = run_log.abandon_unfinished(Utc::now()).await?;
    if abandoned > 0 {
        warn!(count = abandoned, "marked runs left unfinished by a previous process as aborted");
    }
    let run_log: Arc<dyn RunLog> = Arc::new(run_log);

    let pipelines = build_pipelines(
        cfg,
        cfg.class_settings(),
        Arc::clone(&run_log),
        Arc::new(NoProgress),
    )?;
    let scheduler = RunScheduler::new(pipelines, run_log);
    if cfg.scheduler.enabled {
        scheduler.start_all();
    } else {
        info!("scheduler disabled; runs start only through the API");
    }

    let result = server::run_server(&cfg.server.bind, Arc::clone(&scheduler), shutdown).await;
    scheduler.shutdown();
    info!("shut down");
    result
}
