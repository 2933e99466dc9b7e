//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only way the pipeline touches stored
//! vectors. It also serves as the fingerprint store: each point's payload
//! carries the fingerprint of the text it was embedded from, and
//! [`exists`](VectorIndex::exists) reads it back without the vector.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ensure_collection`](VectorIndex::ensure_collection) | Create the collection, or verify its dimension |
//! | [`exists`](VectorIndex::exists) | Stored fingerprint for a point id, if any |
//! | [`upsert`](VectorIndex::upsert) | Overwrite-in-place write of one point |
//! | [`search`](VectorIndex::search) | Nearest neighbours by cosine similarity |
//!
//! Errors use [`PipelineError::StoreUnavailable`] when the store cannot be
//! reached (fatal to the run) and [`PipelineError::StoreRejected`] when a
//! single write is refused.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::models::{IndexedDocument, SearchHit, StoredFingerprint};

pub use memory::InMemoryIndex;

/// Payload field holding the content fingerprint.
pub const FINGERPRINT_FIELD: &str = "fingerprint";
/// Payload field holding the namespaced domain key.
pub const KEY_FIELD: &str = "key";

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection with `dims`-sized cosine vectors if missing.
    ///
    /// An existing collection with a different dimension is an error: no
    /// write into it could be trusted.
    async fn ensure_collection(&self, dims: usize) -> Result<(), PipelineError>;

    async fn exists(&self, id: &str) -> Result<Option<StoredFingerprint>, PipelineError>;

    /// Idempotent: writing the same point twice leaves one point.
    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), PipelineError>;

    /// Hits ordered by descending score; see [`rank_hits`].
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchHit>, PipelineError>;
}

/// Sort by descending score, breaking ties by ascending point id.
///
/// Point ids are derived from domain keys, so equal scores always come out
/// in the same order regardless of insertion history or backend.
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
