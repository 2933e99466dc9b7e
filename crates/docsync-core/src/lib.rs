//! # docsync core
//!
//! Runtime-free building blocks for the docsync pipeline: data models, the
//! error taxonomy, content fingerprints, the embedding and vector-index
//! traits, and run bookkeeping types.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! sources, extractors, embedding providers, and the Qdrant client live in
//! the `docsync` app crate; the in-memory index here backs tests and
//! ephemeral runs.

pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod models;
pub mod run;

pub use error::{ErrorKind, PipelineError};
