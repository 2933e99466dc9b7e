//! HTTP embedding providers.
//!
//! Implements [`EmbeddingGenerator`] for two hosted APIs:
//!
//! | Provider | Endpoint | Auth |
//! |----------|----------|------|
//! | `gemini` | `POST {base}/models/{model}:batchEmbedContents` | `x-goog-api-key` header |
//! | `openai` | `POST {base}/embeddings` | `Authorization: Bearer` |
//!
//! Both go through the same batch endpoint whether one text or many is
//! embedded, so a document embedded alone and the same document embedded
//! in a batch get identical vectors. Large inputs are split into requests
//! of `batch_size` texts; order is preserved across the split.
//!
//! Rate limits (429), server errors, and network failures are retried
//! with exponential backoff up to `max_retries` extra attempts. Any other
//! error status fails the batch with [`PipelineError::Embedding`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use docsync_core::embedding::{check_batch, EmbeddingGenerator};
use docsync_core::PipelineError;

use crate::config::{read_secret, EmbeddingConfig};
use crate::retry::{is_retryable_error, should_retry, Backoff};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Gemini,
    OpenAi,
}

pub struct HttpEmbedder {
    http: reqwest::Client,
    provider: Provider,
    model: String,
    dims: usize,
    batch_size: usize,
    max_input_chars: usize,
    base_url: String,
    api_key: String,
    backoff: Backoff,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        let provider = match config.provider.as_str() {
            "gemini" => Provider::Gemini,
            "openai" => Provider::OpenAi,
            other => anyhow::bail!("Unknown embedding provider: {}", other),
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| match provider {
                Provider::Gemini => GEMINI_BASE_URL.to_string(),
                Provider::OpenAi => OPENAI_BASE_URL.to_string(),
            })
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            provider,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_input_chars: config.max_input_chars,
            base_url,
            api_key,
            backoff: Backoff::new(config.max_retries + 1, config.retry_base_ms),
        })
    }

    fn request(&self, texts: &[String]) -> reqwest::RequestBuilder {
        match self.provider {
            Provider::Gemini => {
                let model = format!("models/{}", self.model);
                let requests: Vec<serde_json::Value> = texts
                    .iter()
                    .map(|text| {
                        serde_json::json!({
                            "model": model,
                            "content": { "parts": [{ "text": text }] },
                            "outputDimensionality": self.dims,
                        })
                    })
                    .collect();
                self.http
                    .post(format!(
                        "{}/models/{}:batchEmbedContents",
                        self.base_url, self.model
                    ))
                    .header("x-goog-api-key", &self.api_key)
                    .json(&serde_json::json!({ "requests": requests }))
            }
            Provider::OpenAi => self
                .http
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({
                    "model": self.model,
                    "input": texts,
                })),
        }
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.request(texts).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await.map_err(|e| {
                        PipelineError::Embedding(format!("invalid embedding response: {}", e))
                    })?;
                    let vectors = match self.provider {
                        Provider::Gemini => parse_gemini_response(body)?,
                        Provider::OpenAi => parse_openai_response(body)?,
                    };
                    check_batch(texts.len(), self.dims, &vectors)?;
                    return Ok(vectors);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if should_retry(status) && self.backoff.can_retry(attempt) {
                        warn!(attempt, %status, "embedding request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::Embedding(format!(
                        "embedding API error {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    if is_retryable_error(&e) && self.backoff.can_retry(attempt) {
                        warn!(attempt, error = %e, "embedding request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::Embedding(format!(
                        "embedding request failed: {}",
                        e
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingGenerator for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

fn parse_gemini_response(body: serde_json::Value) -> Result<Vec<Vec<f32>>, PipelineError> {
    let parsed: GeminiResponse = serde_json::from_value(body)
        .map_err(|e| PipelineError::Embedding(format!("invalid Gemini response: {}", e)))?;
    Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

fn parse_openai_response(body: serde_json::Value) -> Result<Vec<Vec<f32>>, PipelineError> {
    let mut parsed: OpenAiResponse = serde_json::from_value(body)
        .map_err(|e| PipelineError::Embedding(format!("invalid OpenAI response: {}", e)))?;
    parsed.data.sort_by_key(|entry| entry.index);
    Ok(parsed.data.into_iter().map(|e| e.embedding).collect())
}

/// Build the configured provider, reading its API key from the environment.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingGenerator>> {
    let api_key = read_secret(config.api_key_env())?;
    Ok(Arc::new(HttpEmbedder::new(config, api_key)?))
}
