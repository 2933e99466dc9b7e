//! In-memory [`VectorIndex`] for tests and ephemeral runs.
//!
//! Points live in a `BTreeMap` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored vector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::PipelineError;
use crate::models::{IndexedDocument, SearchHit, StoredFingerprint};

use super::{rank_hits, VectorIndex};

pub struct InMemoryIndex {
    dims: RwLock<Option<usize>>,
    points: RwLock<BTreeMap<String, IndexedDocument>>,
    available: AtomicBool,
    upserts: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            dims: RwLock::new(None),
            points: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `upsert` calls since creation.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read_points().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<IndexedDocument> {
        self.read_points().get(id).cloned()
    }

    /// Snapshot of every stored point, ordered by id.
    pub fn snapshot(&self) -> Vec<IndexedDocument> {
        self.read_points().values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), PipelineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::StoreUnavailable(
                "in-memory index marked unavailable".into(),
            ))
        }
    }

    fn read_points(&self) -> RwLockReadGuard<'_, BTreeMap<String, IndexedDocument>> {
        self.points.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_points(&self) -> RwLockWriteGuard<'_, BTreeMap<String, IndexedDocument>> {
        self.points.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), PipelineError> {
        self.check_available()?;
        let mut current = self.dims.write().unwrap_or_else(|e| e.into_inner());
        match *current {
            Some(existing) if existing != dims => Err(PipelineError::StoreUnavailable(format!(
                "collection has dimension {}, expected {}",
                existing, dims
            ))),
            Some(_) => Ok(()),
            None => {
                *current = Some(dims);
                Ok(())
            }
        }
    }

    async fn exists(&self, id: &str) -> Result<Option<StoredFingerprint>, PipelineError> {
        self.check_available()?;
        Ok(self.read_points().get(id).map(|doc| StoredFingerprint {
            fingerprint: doc.fingerprint.clone(),
            key: Some(doc.key.clone()),
        }))
    }

    async fn upsert(&self, doc: &IndexedDocument) -> Result<(), PipelineError> {
        self.check_available()?;
        let dims = *self.dims.read().unwrap_or_else(|e| e.into_inner());
        if let Some(dims) = dims {
            if doc.vector.len() != dims {
                return Err(PipelineError::StoreRejected(format!(
                    "vector has {} dimensions, collection expects {}",
                    doc.vector.len(),
                    dims
                )));
            }
        }
        self.write_points().insert(doc.id.clone(), doc.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        self.check_available()?;
        let mut hits: Vec<SearchHit> = self
            .read_points()
            .values()
            .map(|doc| SearchHit {
                id: doc.id.clone(),
                score: cosine_similarity(vector, &doc.vector),
                payload: doc.payload.clone(),
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }
}
