//! Data models that flow through a pipeline run.
//!
//! Remote documents come in, extracted text and vectors are derived in
//! memory, and only [`IndexedDocument`] ever reaches the vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing entry for one remote file. Carries no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocumentMeta {
    /// Source-native file identifier.
    pub external_id: String,
    pub name: String,
    /// Authoritative for change detection.
    pub last_modified: DateTime<Utc>,
    pub size: Option<u64>,
    pub web_url: Option<String>,
}

impl RemoteDocumentMeta {
    /// File name with its final extension removed (`"84011000.json"` → `"84011000"`).
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(0) | None => &self.name,
            Some(pos) => &self.name[..pos],
        }
    }

    /// Lowercased final extension without the dot.
    pub fn extension(&self) -> Option<String> {
        match self.name.rfind('.') {
            Some(0) | None => None,
            Some(pos) => Some(self.name[pos + 1..].to_ascii_lowercase()),
        }
    }
}

/// A fetched remote document.
///
/// Immutable once constructed. Fetching the same external id again yields
/// a new value; nothing in the pipeline caches or mutates a fetched one.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    meta: RemoteDocumentMeta,
    content: Vec<u8>,
    fetched_at: DateTime<Utc>,
}

impl RemoteDocument {
    pub fn new(meta: RemoteDocumentMeta, content: Vec<u8>) -> Self {
        Self {
            meta,
            content,
            fetched_at: Utc::now(),
        }
    }

    pub fn meta(&self) -> &RemoteDocumentMeta {
        &self.meta
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// How a piece of text was obtained from binary content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Ocr,
    TextLayer,
    Ooxml,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMeta {
    pub page_count: Option<u32>,
    pub confidence: Option<f32>,
    pub language: Option<String>,
    /// Set when `confidence` is below the configured minimum.
    #[serde(default)]
    pub low_confidence: bool,
}

/// Plain text derived from binary content. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub method: ExtractionMethod,
    pub meta: ExtractionMeta,
}

/// The persisted unit: one vector per domain key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    /// Vector-store point id, derived from `key`.
    pub id: String,
    /// Class-namespaced domain key (`"<class>:<domain_key>"`).
    pub key: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
    pub fingerprint: String,
}

/// What [`VectorIndex::exists`](crate::index::VectorIndex::exists) reports for a stored point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub fingerprint: String,
    /// Namespaced key recorded at upsert time, if the payload has one.
    pub key: Option<String>,
}

/// One ranked result from a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}
