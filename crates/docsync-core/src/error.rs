//! Error taxonomy for pipeline runs.
//!
//! Every stage returns [`PipelineError`]. The orchestrator decides scope from
//! the variant: [`PipelineError::is_fatal`] errors abort the whole run, every
//! other variant is folded into the failing document's outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Token acquisition or refresh failed. Fatal.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or rate-limit failure that survived the retry budget.
    #[error("transient I/O failure after retries: {0}")]
    TransientIo(String),

    #[error("text extraction failed: {reason}")]
    Extraction {
        reason: String,
        partial_text: Option<String>,
    },

    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The vector index cannot be reached, or its collection is unusable. Fatal.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// The vector index refused one write (bad vector, bad payload).
    #[error("vector store rejected write: {0}")]
    StoreRejected(String),

    #[error("key collision on '{key}': {detail}")]
    KeyCollision { key: String, detail: String },

    /// Listing the remote folder failed outright.
    #[error("listing failed: {0}")]
    Listing(String),

    /// The fetched content cannot be mapped to a record (no key, bad JSON).
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Serializable discriminant of [`PipelineError`], stored in run outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    TransientIo,
    Extraction,
    Embedding,
    StoreUnavailable,
    StoreRejected,
    KeyCollision,
    Listing,
    InvalidDocument,
}

impl PipelineError {
    /// Run-scoped errors: no further document can be processed safely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::StoreUnavailable(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::TransientIo(_) => ErrorKind::TransientIo,
            Self::Extraction { .. } => ErrorKind::Extraction,
            Self::Embedding(_) => ErrorKind::Embedding,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::StoreRejected(_) => ErrorKind::StoreRejected,
            Self::KeyCollision { .. } => ErrorKind::KeyCollision,
            Self::Listing(_) => ErrorKind::Listing,
            Self::InvalidDocument(_) => ErrorKind::InvalidDocument,
        }
    }

    pub fn extraction(reason: impl Into<String>) -> Self {
        Self::Extraction {
            reason: reason.into(),
            partial_text: None,
        }
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::TransientIo => "transient_io",
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::StoreUnavailable => "store_unavailable",
            Self::StoreRejected => "store_rejected",
            Self::KeyCollision => "key_collision",
            Self::Listing => "listing",
            Self::InvalidDocument => "invalid_document",
        }
    }
}
