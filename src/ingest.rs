//! Pipeline orchestration for one document class.
//!
//! [`PipelineOrchestrator::sync_and_upsert`] runs the whole flow:
//!
//! 1. Pick the sync window from the class checkpoint, or the initial lookback.
//! 2. List candidates and fetch each one; a failing document is recorded and skipped.
//! 3. Extract text where the class needs it (OCR, local parsing) and decode records.
//! 4. Fingerprint exactly the text that will be embedded.
//! 5. Compare with the stored fingerprint; unchanged records are skipped.
//! 6. Embed the rest in batches, isolating a failing batch item by item.
//! 7. Dry run: report `would_upsert` and stop.
//! 8. Otherwise upsert each record; one rejected write does not block others.
//! 9. Return a [`RunSummary`] with counts and one outcome per record.
//!
//! Document-scoped errors are folded into the summary. Run-scoped errors
//! (authentication, vector store unavailable) are returned as `Err` so the
//! scheduler can mark the run aborted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use docsync_core::embedding::{prepare_input, EmbeddingGenerator};
use docsync_core::fingerprint::{content_fingerprint, namespaced_key, point_id};
use docsync_core::index::{VectorIndex, FINGERPRINT_FIELD, KEY_FIELD};
use docsync_core::models::{
    ExtractedText, IndexedDocument, RemoteDocument, RemoteDocumentMeta, SearchHit,
};
use docsync_core::run::{Outcome, RunMode, RunSummary};
use docsync_core::PipelineError;

use crate::classes::{ClassRecord, Decoded, ExtractionRoute};
use crate::config::{ClassSettings, LowConfidencePolicy};
use crate::extract::{run_blocking, LocalExtractor};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::runlog::RunLog;
use crate::traits::{DocumentSource, ExtractOptions, Listing, TextExtractor};

/// Where the sync window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWindow {
    /// From the class checkpoint, or the initial lookback without one.
    Checkpoint,
    /// Everything the source has.
    Full,
    /// From an explicit instant.
    Since(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub window: SyncWindow,
}

impl SyncOptions {
    pub fn incremental(dry_run: bool) -> Self {
        Self {
            dry_run,
            window: SyncWindow::Checkpoint,
        }
    }
}

/// A record that changed and still needs a vector.
struct Pending {
    key: String,
    id: String,
    source: String,
    text: String,
    fingerprint: String,
    truncated: bool,
    payload: Map<String, Value>,
}

pub struct PipelineOrchestrator {
    settings: ClassSettings,
    source: Arc<dyn DocumentSource>,
    ocr: Option<Arc<dyn TextExtractor>>,
    local: Arc<dyn TextExtractor>,
    embedder: Arc<dyn EmbeddingGenerator>,
    index: Arc<dyn VectorIndex>,
    run_log: Arc<dyn RunLog>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: ClassSettings,
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn EmbeddingGenerator>,
        index: Arc<dyn VectorIndex>,
        run_log: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            settings,
            source,
            ocr: None,
            local: Arc::new(LocalExtractor),
            embedder,
            index,
            run_log,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn TextExtractor>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_local_extractor(mut self, local: Arc<dyn TextExtractor>) -> Self {
        self.local = local;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn class(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ClassSettings {
        &self.settings
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingGenerator> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Incremental sync from the class checkpoint.
    pub async fn sync_and_upsert(&self, dry_run: bool) -> Result<RunSummary, PipelineError> {
        self.run(&SyncOptions::incremental(dry_run), Utc::now())
            .await
    }

    /// Run with an explicit window. `started_at` is the instant the class
    /// checkpoint moves to if this run ends up advancing it.
    pub async fn run(
        &self,
        options: &SyncOptions,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary, PipelineError> {
        let class = self.settings.name.as_str();
        let mode = RunMode::from_dry_run(options.dry_run);
        let (window_start, covers_checkpoint) = self.window(options.window, started_at).await?;
        let mut summary = RunSummary::new(class, mode, window_start, covers_checkpoint);

        info!(
            class,
            source = self.source.label(),
            mode = %mode,
            since = %window_start.to_rfc3339(),
            "sync started"
        );

        // A dry run must not create anything, not even an empty collection.
        if !options.dry_run {
            self.index.ensure_collection(self.embedder.dims()).await?;
        }

        self.progress.report(SyncProgressEvent::Discovering {
            class: class.to_string(),
        });
        let listing = match self.source.list_candidates(window_start).await {
            Ok(listing) => listing,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(class, error = %e, "listing failed");
                summary.listing_errors.push(e.to_string());
                Listing::default()
            }
        };
        for page_error in &listing.errors {
            warn!(class, error = %page_error, "listing incomplete");
        }
        summary.listing_errors.extend(listing.errors);
        summary.counts.fetched = listing.candidates.len() as u64;

        let total = listing.candidates.len() as u64;
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut pending = Vec::new();
        for (n, meta) in listing.candidates.iter().enumerate() {
            self.prepare_candidate(meta, &mut claimed, &mut pending, &mut summary)
                .await?;
            self.progress.report(SyncProgressEvent::Processing {
                class: class.to_string(),
                n: n as u64 + 1,
                total,
                key: meta.name.clone(),
            });
        }

        let embedded = self.embed_pending(pending, &mut summary).await;
        for (doc, vector) in embedded {
            if options.dry_run {
                summary.record_with(doc.key, doc.source, Outcome::WouldUpsert, doc.truncated);
                continue;
            }
            let indexed = IndexedDocument {
                id: doc.id,
                key: doc.key,
                vector,
                payload: Value::Object(doc.payload),
                fingerprint: doc.fingerprint,
            };
            match self.index.upsert(&indexed).await {
                Ok(()) => {
                    debug!(class, key = %indexed.key, "upserted");
                    summary.record_with(indexed.key, doc.source, Outcome::Upserted, doc.truncated);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(class, key = %indexed.key, error = %e, "upsert failed");
                    summary.record_failure(indexed.key, doc.source, &e);
                }
            }
        }

        info!(
            class,
            status = %summary.status(),
            fetched = summary.counts.fetched,
            upserted = summary.counts.upserted,
            would_upsert = summary.counts.would_upsert,
            skipped = summary.counts.skipped_unchanged,
            failed = summary.counts.failed,
            "sync finished"
        );
        Ok(summary)
    }

    /// Nearest neighbours of `query` in this class's collection.
    ///
    /// The query goes through the same truncation and model as indexed
    /// documents, so both live in one vector space.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        let prepared = prepare_input(query, self.embedder.max_input_chars());
        if prepared.text.is_empty() {
            return Err(PipelineError::InvalidDocument(
                "query must not be empty".into(),
            ));
        }
        let vector = self.embedder.embed(&prepared.text).await?;
        self.index.search(&vector, top_k.max(1)).await
    }

    /// Window start, and whether it reaches back to the current checkpoint.
    async fn window(
        &self,
        window: SyncWindow,
        started_at: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, bool), PipelineError> {
        let checkpoint = self
            .run_log
            .checkpoint(&self.settings.name)
            .await
            .map_err(|e| PipelineError::StoreUnavailable(format!("run log: {:#}", e)))?;
        let default_start = checkpoint.unwrap_or(started_at - self.settings.initial_lookback);
        Ok(match window {
            SyncWindow::Checkpoint => (default_start, true),
            SyncWindow::Full => (DateTime::<Utc>::UNIX_EPOCH, true),
            SyncWindow::Since(since) => (since, since <= default_start),
        })
    }

    /// Steps 2 to 5 for one listed file.
    async fn prepare_candidate(
        &self,
        meta: &RemoteDocumentMeta,
        claimed: &mut HashMap<String, String>,
        pending: &mut Vec<Pending>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let class = self.settings.name.as_str();
        let doc = match self.source.fetch(meta).await {
            Ok(doc) => doc,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(class, file = %meta.name, error = %e, "fetch failed");
                summary.record_failure(&meta.name, &meta.name, &e);
                return Ok(());
            }
        };

        let decoded = match self.extract(&doc).await {
            Ok(extracted) => self.decode(doc, extracted).await,
            Err(e) => Err(e),
        };
        let (doc, decoded) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(class, file = %meta.name, error = %e, "document skipped");
                summary.record_failure(&meta.name, &meta.name, &e);
                return Ok(());
            }
        };

        for rejected in decoded.rejected {
            warn!(class, file = %meta.name, key = %rejected.key, error = %rejected.error, "record skipped");
            summary.record_failure(
                namespaced_key(class, &rejected.key),
                &meta.name,
                &rejected.error,
            );
        }

        for record in decoded.records {
            let key = namespaced_key(class, record.domain_key());
            if let Some(first) = claimed.get(&key) {
                let err = PipelineError::KeyCollision {
                    key: key.clone(),
                    detail: format!("already produced by {} in this run", first),
                };
                error!(class, key = %key, file = %meta.name, "key collision");
                summary.record_failure(key, &meta.name, &err);
                continue;
            }
            claimed.insert(key.clone(), meta.name.clone());

            let prepared = prepare_input(&record.embed_text(), self.embedder.max_input_chars());
            if prepared.text.is_empty() {
                let err = PipelineError::InvalidDocument("record has no text to embed".into());
                summary.record_failure(key, &meta.name, &err);
                continue;
            }
            if prepared.truncated {
                warn!(class, key = %key, chars = prepared.original_chars, "embedding input truncated");
            }
            let fingerprint = content_fingerprint(self.embedder.model_name(), &prepared.text);
            let id = point_id(&key);

            let stored = match self.index.exists(&id).await {
                Ok(stored) => stored,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    summary.record_failure(key, &meta.name, &e);
                    continue;
                }
            };
            if let Some(stored) = stored {
                if let Some(stored_key) = stored.key.as_deref().filter(|k| *k != key) {
                    let err = PipelineError::KeyCollision {
                        key: key.clone(),
                        detail: format!("point {} already holds {}", id, stored_key),
                    };
                    error!(class, key = %key, stored = stored_key, "key collision");
                    summary.record_failure(key, &meta.name, &err);
                    continue;
                }
                if stored.fingerprint == fingerprint {
                    summary.record_with(
                        key,
                        &meta.name,
                        Outcome::SkippedUnchanged,
                        prepared.truncated,
                    );
                    continue;
                }
            }

            let payload = build_payload(
                class,
                &record,
                doc.meta(),
                &key,
                &fingerprint,
                prepared.truncated,
            );
            pending.push(Pending {
                key,
                id,
                source: meta.name.clone(),
                text: prepared.text,
                fingerprint,
                truncated: prepared.truncated,
                payload,
            });
        }
        Ok(())
    }

    /// Decode on the blocking pool; spreadsheets can be large.
    async fn decode(
        &self,
        doc: RemoteDocument,
        extracted: Option<ExtractedText>,
    ) -> Result<(RemoteDocument, Decoded), PipelineError> {
        let kind = self.settings.kind;
        let key_field = self.settings.key_field.clone();
        let name = doc.meta().name.clone();
        run_blocking(&name, move || {
            let decoded = kind.decode(&doc, extracted, &key_field)?;
            Ok((doc, decoded))
        })
        .await
    }

    /// Text for routes that need it, with the low-confidence policy applied.
    async fn extract(&self, doc: &RemoteDocument) -> Result<Option<ExtractedText>, PipelineError> {
        let route = self.settings.kind.route(doc, self.settings.extraction);
        let options = ExtractOptions::from(&self.settings.ocr);
        let name = doc.meta().name.as_str();
        let extracted = match route {
            ExtractionRoute::Structured | ExtractionRoute::Spreadsheet => return Ok(None),
            ExtractionRoute::Local => self.local.extract(doc.content(), name, &options).await?,
            ExtractionRoute::Ocr => {
                let ocr = self
                    .ocr
                    .as_ref()
                    .ok_or_else(|| PipelineError::extraction("no OCR service configured"))?;
                ocr.extract(doc.content(), name, &options).await?
            }
        };

        if extracted.meta.low_confidence {
            let confidence = extracted.meta.confidence.unwrap_or_default();
            match self.settings.ocr.low_confidence {
                LowConfidencePolicy::Index => {
                    warn!(
                        class = %self.settings.name,
                        file = name,
                        confidence,
                        "low OCR confidence, indexing anyway"
                    );
                }
                LowConfidencePolicy::Skip => {
                    return Err(PipelineError::Extraction {
                        reason: format!(
                            "OCR confidence {:.2} below minimum {:.2}",
                            confidence, self.settings.ocr.min_confidence
                        ),
                        partial_text: Some(extracted.text),
                    });
                }
            }
        }
        Ok(Some(extracted))
    }

    /// Embed in batches. A failed batch is retried one item at a time so
    /// only the offending records fail.
    async fn embed_pending(
        &self,
        pending: Vec<Pending>,
        summary: &mut RunSummary,
    ) -> Vec<(Pending, Vec<f32>)> {
        let batch_size = self.settings.embedding.batch_size.max(1);
        let mut out = Vec::with_capacity(pending.len());
        let mut pending = pending.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<Pending> = pending.by_ref().take(batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => out.extend(batch.into_iter().zip(vectors)),
                Err(e) => {
                    warn!(class = %self.settings.name, error = %e, size = batch.len(), "batch embedding failed, embedding individually");
                    for doc in batch {
                        match self.embedder.embed(&doc.text).await {
                            Ok(vector) => out.push((doc, vector)),
                            Err(e) => {
                                warn!(class = %self.settings.name, key = %doc.key, error = %e, "embedding failed");
                                summary.record_failure(doc.key, doc.source, &e);
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

fn build_payload(
    class: &str,
    record: &ClassRecord,
    meta: &RemoteDocumentMeta,
    key: &str,
    fingerprint: &str,
    truncated: bool,
) -> Map<String, Value> {
    let mut payload = record.fields();
    payload.insert("source_class".into(), Value::from(class));
    payload.insert("domain_key".into(), Value::from(record.domain_key()));
    payload.insert(KEY_FIELD.into(), Value::from(key));
    payload.insert("external_id".into(), Value::from(meta.external_id.clone()));
    payload.insert("name".into(), Value::from(meta.name.clone()));
    payload.insert("web_url".into(), Value::from(meta.web_url.clone()));
    payload.insert(
        "last_modified".into(),
        Value::from(meta.last_modified.to_rfc3339()),
    );
    payload.insert(FINGERPRINT_FIELD.into(), Value::from(fingerprint));
    if let Some(info) = record.extraction() {
        payload.insert(
            "extraction_method".into(),
            serde_json::to_value(info.method).unwrap_or(Value::Null),
        );
        payload.insert("page_count".into(), Value::from(info.meta.page_count));
        payload.insert("confidence".into(), Value::from(info.meta.confidence));
        payload.insert("language".into(), Value::from(info.meta.language.clone()));
        payload.insert("low_confidence".into(), Value::from(info.meta.low_confidence));
    }
    if truncated {
        payload.insert("truncated".into(), Value::Bool(true));
    }
    payload
}
