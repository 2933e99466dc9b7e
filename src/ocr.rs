//! OCR service client.
//!
//! Sends documents to `POST {url}/ocr` as multipart form data with an
//! `X-API-Key` header and reads back `{ text, metadata }`. Timeouts and 5xx
//! responses are retried a bounded number of times; anything else fails the
//! document with [`PipelineError::Extraction`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use docsync_core::models::{ExtractedText, ExtractionMeta, ExtractionMethod};
use docsync_core::PipelineError;

use crate::config::OcrConfig;
use crate::retry::{should_retry, Backoff};
use crate::traits::{ExtractOptions, TextExtractor};

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    metadata: OcrMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct OcrMetadata {
    page_count: Option<u32>,
    confidence: Option<f32>,
    language: Option<String>,
}

pub struct OcrClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    backoff: Backoff,
}

impl OcrClient {
    pub fn new(config: &OcrConfig, api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/ocr", config.url.trim_end_matches('/')),
            api_key,
            backoff: Backoff::new(config.max_attempts, config.retry_base_ms),
        })
    }

    /// Multipart bodies are consumed by `send`, so each attempt builds its own.
    fn form(&self, content: &[u8], file_name: &str, options: &ExtractOptions) -> Form {
        let part = Part::bytes(content.to_vec()).file_name(file_name.to_string());
        let part = match mime_for(file_name) {
            Some(mime) => part.mime_str(mime).unwrap_or_else(|_| {
                Part::bytes(content.to_vec()).file_name(file_name.to_string())
            }),
            None => part,
        };
        Form::new()
            .part("file", part)
            .text("lang", options.lang.clone())
            .text("page_range", options.page_range.clone())
            .text("dpi", options.dpi.to_string())
            .text("min_confidence", options.min_confidence.to_string())
            .text("detect_headings", options.detect_headings.to_string())
            .text("force_ocr", options.force_ocr.to_string())
    }
}

fn mime_for(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

#[async_trait]
impl TextExtractor for OcrClient {
    async fn extract(
        &self,
        content: &[u8],
        file_name: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractedText, PipelineError> {
        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            let sent = self
                .http
                .post(&self.endpoint)
                .header("X-API-Key", &self.api_key)
                .multipart(self.form(content, file_name, options))
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => break resp,
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if should_retry(status) && self.backoff.can_retry(attempt) {
                        warn!(file = file_name, attempt, %status, "OCR request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::extraction(format!(
                        "OCR service returned {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    if (e.is_timeout() || e.is_connect()) && self.backoff.can_retry(attempt) {
                        warn!(file = file_name, attempt, error = %e, "OCR request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::extraction(format!(
                        "OCR request failed after {} attempts: {}",
                        attempt, e
                    )));
                }
            }
        };

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::extraction(format!("invalid OCR response: {}", e)))?;

        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::extraction("OCR returned no text"));
        }

        let low_confidence = parsed
            .metadata
            .confidence
            .map(|c| c < options.min_confidence)
            .unwrap_or(false);
        debug!(
            file = file_name,
            pages = parsed.metadata.page_count,
            confidence = parsed.metadata.confidence,
            low_confidence,
            "OCR complete"
        );

        Ok(ExtractedText {
            text,
            method: ExtractionMethod::Ocr,
            meta: ExtractionMeta {
                page_count: parsed.metadata.page_count,
                confidence: parsed.metadata.confidence,
                language: parsed.metadata.language,
                low_confidence,
            },
        })
    }
}
