//! Wiring: one [`PipelineOrchestrator`] per configured class.
//!
//! All classes share a single Graph client (one token cache). Embedding
//! providers, vector-store clients, and OCR clients are built per class
//! because classes may override the model, dimension, store, or OCR
//! settings.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::classes::ClassKind;
use crate::config::{read_secret, ClassSettings, Config, ExtractionMode};
use crate::connector_graph::{GraphClient, GraphSource};
use crate::db;
use crate::embedding::create_embedder;
use crate::ingest::PipelineOrchestrator;
use crate::migrate;
use crate::ocr::OcrClient;
use crate::progress::SyncProgressReporter;
use crate::qdrant::QdrantIndex;
use crate::runlog::{RunLog, SqliteRunLog};

/// Connect to the run-log database, creating the schema if needed.
pub async fn open_run_log(config: &Config) -> Result<SqliteRunLog> {
    let pool = db::connect(&config.db.path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
    migrate::run_migrations(&pool).await?;
    Ok(SqliteRunLog::new(pool))
}

pub fn graph_client(config: &Config) -> Result<Arc<GraphClient>> {
    let secret = read_secret(&config.remote.client_secret_env)?;
    Ok(Arc::new(GraphClient::new(config.remote.clone(), secret)?))
}

/// Build the orchestrator for one class.
pub fn build_pipeline(
    settings: ClassSettings,
    client: Arc<GraphClient>,
    run_log: Arc<dyn RunLog>,
    progress: Arc<dyn SyncProgressReporter>,
) -> Result<PipelineOrchestrator> {
    let name = settings.name.clone();
    let source = GraphSource::new(client, &settings.folder, &settings.include_globs)
        .with_context(|| format!("classes.{}: invalid include_globs", name))?;
    let embedder = create_embedder(&settings.embedding)
        .with_context(|| format!("classes.{}: embedding provider", name))?;
    let store_key = std::env::var(&settings.vector_store.api_key_env).ok();
    let index = QdrantIndex::new(&settings.vector_store, &settings.collection, store_key)?;

    let needs_ocr = matches!(settings.kind, ClassKind::Procedure | ClassKind::General)
        && settings.extraction == ExtractionMode::Ocr;
    let ocr = if needs_ocr {
        let key = read_secret(&settings.ocr.api_key_env)
            .with_context(|| format!("classes.{}: OCR API key", name))?;
        Some(OcrClient::new(&settings.ocr, key)?)
    } else {
        None
    };

    debug!(class = %name, kind = %settings.kind, ocr = needs_ocr, "pipeline built");
    let mut pipeline = PipelineOrchestrator::new(
        settings,
        Arc::new(source),
        embedder,
        Arc::new(index),
        run_log,
    )
    .with_progress(progress);
    if let Some(ocr) = ocr {
        pipeline = pipeline.with_ocr(Arc::new(ocr));
    }
    Ok(pipeline)
}

/// Orchestrators for `classes`, sharing one Graph client.
pub fn build_pipelines(
    config: &Config,
    classes: Vec<ClassSettings>,
    run_log: Arc<dyn RunLog>,
    progress: Arc<dyn SyncProgressReporter>,
) -> Result<Vec<Arc<PipelineOrchestrator>>> {
    let client = graph_client(config)?;
    classes
        .into_iter()
        .map(|settings| {
            build_pipeline(
                settings,
                Arc::clone(&client),
                Arc::clone(&run_log),
                Arc::clone(&progress),
            )
            .map(Arc::new)
        })
        .collect()
}
