//! Extension traits for the pipeline's external collaborators.
//!
//! - [`DocumentSource`] lists and downloads documents from a remote store.
//! - [`TextExtractor`] turns binary documents into plain text.
//!
//! The embedding and vector-index seams live in `docsync-core`
//! ([`EmbeddingGenerator`](docsync_core::embedding::EmbeddingGenerator),
//! [`VectorIndex`](docsync_core::index::VectorIndex)) because they carry
//! no runtime dependencies.
//!
//! Implementations must be `Send + Sync`: one instance is shared by the
//! scheduler's timer task and by manual triggers for the same class.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docsync_core::models::{ExtractedText, RemoteDocument, RemoteDocumentMeta};
use docsync_core::PipelineError;

use crate::config::OcrConfig;

/// Candidates found by one listing pass.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub candidates: Vec<RemoteDocumentMeta>,
    /// Pages that failed after earlier pages succeeded. The candidates
    /// above are then an incomplete view of the folder.
    pub errors: Vec<String>,
}

/// A remote store of documents for one document class.
///
/// # Errors
///
/// - [`PipelineError::Auth`] when credentials cannot be obtained. Fatal.
/// - [`PipelineError::Listing`] when not a single page could be listed.
/// - [`PipelineError::TransientIo`] from `fetch` once retries are spent.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Short label for logs (e.g. `"graph:SOP"`).
    fn label(&self) -> &str;

    /// Files whose `last_modified` is at or after `since`, pagination followed to the end.
    async fn list_candidates(&self, since: DateTime<Utc>) -> Result<Listing, PipelineError>;

    /// Download one document. Each call returns a fresh value.
    async fn fetch(&self, meta: &RemoteDocumentMeta) -> Result<RemoteDocument, PipelineError>;
}

/// Options recognized by text extractors. Local extractors ignore the OCR-only ones.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOptions {
    pub lang: String,
    pub page_range: String,
    pub dpi: u32,
    pub min_confidence: f32,
    pub detect_headings: bool,
    pub force_ocr: bool,
}

impl From<&OcrConfig> for ExtractOptions {
    fn from(config: &OcrConfig) -> Self {
        Self {
            lang: config.lang.clone(),
            page_range: config.page_range.clone(),
            dpi: config.dpi,
            min_confidence: config.min_confidence,
            detect_headings: config.detect_headings,
            force_ocr: config.force_ocr,
        }
    }
}

/// Converts binary content (PDF, images, Office files) into text.
///
/// A confidence below `min_confidence` is not an error: the result comes
/// back with [`low_confidence`](docsync_core::models::ExtractionMeta::low_confidence)
/// set and the caller applies its policy.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(
        &self,
        content: &[u8],
        file_name: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractedText, PipelineError>;
}
