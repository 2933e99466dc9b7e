//! Embedding generator trait and vector utilities.
//!
//! Concrete HTTP providers live in the `docsync` app crate. Everything that
//! turns document or query text into model input goes through
//! [`prepare_input`], so indexed content and search queries are always
//! transformed the same way.

use async_trait::async_trait;

use crate::error::PipelineError;

/// Converts text into fixed-dimension vectors.
///
/// `embed_batch` must preserve input order and return, for each input,
/// exactly what `embed` would return for it alone. Batching is only a
/// throughput optimization.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-004"`). Part of every fingerprint.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Longest input, in characters, sent to the model.
    fn max_input_chars(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".into()))
    }
}

/// Model input after deterministic truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInput {
    pub text: String,
    /// Character count before truncation.
    pub original_chars: usize,
    pub truncated: bool,
}

/// Normalize whitespace at the edges and cut to `max_chars` characters.
///
/// Truncation always keeps the leading prefix, on a char boundary, so the
/// same input yields the same model input on every run.
pub fn prepare_input(text: &str, max_chars: usize) -> PreparedInput {
    let trimmed = text.trim();
    let original_chars = trimmed.chars().count();
    if original_chars <= max_chars {
        return PreparedInput {
            text: trimmed.to_string(),
            original_chars,
            truncated: false,
        };
    }
    let end = trimmed
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    PreparedInput {
        text: trimmed[..end].to_string(),
        original_chars,
        truncated: true,
    }
}

/// Check a provider response against the request before handing it on.
pub fn check_batch(
    expected: usize,
    dims: usize,
    vectors: &[Vec<f32>],
) -> Result<(), PipelineError> {
    if vectors.len() != expected {
        return Err(PipelineError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(PipelineError::Embedding(format!(
            "provider returned a {}-dimension vector, expected {}",
            bad.len(),
            dims
        )));
    }
    Ok(())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
