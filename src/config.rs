//! Configuration parsing and validation.
//!
//! docsync is configured by one TOML file (default `./config/docsync.toml`).
//! Global sections describe the shared services (remote drive, OCR,
//! embeddings, vector store); each `[classes.<name>]` table describes one
//! independently scheduled document class and may override any of them.
//!
//! Secrets never live in the file. Each secret is named by an `*_env` key
//! holding an environment variable name; `.env` is loaded by the binary
//! before the config is read.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classes::ClassKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

/// Microsoft Graph drive holding the source folders.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    /// Drive id (`/drives/{drive_id}`). Required for shared and SharePoint
    /// drives; takes precedence over `user_id`.
    #[serde(default)]
    pub drive_id: Option<String>,
    /// Owner of a personal drive (`/users/{user_id}/drive`).
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_authority_url")]
    pub authority_url: String,
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_client_secret_env() -> String {
    "GRAPH_CLIENT_SECRET".to_string()
}
fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}
fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_page_size() -> u32 {
    200
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_remote_timeout_secs() -> u64 {
    60
}

/// What to do with OCR output whose confidence is below `min_confidence`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidencePolicy {
    /// Index it anyway, flagged in the payload.
    #[default]
    Index,
    /// Record the document as an extraction failure.
    Skip,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_url")]
    pub url: String,
    #[serde(default = "default_ocr_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_page_range")]
    pub page_range: String,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_true")]
    pub detect_headings: bool,
    #[serde(default = "default_true")]
    pub force_ocr: bool,
    #[serde(default)]
    pub low_confidence: LowConfidencePolicy,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ocr_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            url: default_ocr_url(),
            api_key_env: default_ocr_key_env(),
            lang: default_lang(),
            page_range: default_page_range(),
            dpi: default_dpi(),
            min_confidence: default_min_confidence(),
            detect_headings: true,
            force_ocr: true,
            low_confidence: LowConfidencePolicy::Index,
            timeout_secs: default_ocr_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_ocr_retry_base_ms(),
        }
    }
}

fn default_ocr_url() -> String {
    "http://localhost:8500".to_string()
}
fn default_ocr_key_env() -> String {
    "OCR_API_KEY".to_string()
}
fn default_lang() -> String {
    "en".to_string()
}
fn default_page_range() -> String {
    "all".to_string()
}
fn default_dpi() -> u32 {
    300
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_ocr_timeout_secs() -> u64 {
    180
}
fn default_ocr_retry_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `gemini` or `openai`.
    pub provider: String,
    pub model: String,
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Defaults to `GEMINI_API_KEY` or `OPENAI_API_KEY` by provider.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Override the provider endpoint (proxies, tests).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_batch_size() -> usize {
    32
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embedding_retry_base_ms() -> u64 {
    1000
}

impl EmbeddingConfig {
    pub fn api_key_env(&self) -> &str {
        match (&self.api_key_env, self.provider.as_str()) {
            (Some(var), _) => var,
            (None, "openai") => "OPENAI_API_KEY",
            (None, _) => "GEMINI_API_KEY",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_store_url")]
    pub url: String,
    /// Optional: an unset variable means no API key header.
    #[serde(default = "default_vector_store_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_vector_store_url(),
            api_key_env: default_vector_store_key_env(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_vector_store_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_vector_store_key_env() -> String {
    "QDRANT_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u64,
    /// Sync window for a class that has never completed a run.
    #[serde(default = "default_lookback_hours")]
    pub initial_lookback_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval_minutes: default_interval_minutes(),
            initial_lookback_hours: default_lookback_hours(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    30
}
fn default_lookback_hours() -> u64 {
    24
}

/// How binary documents of a class are turned into text.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// External OCR service.
    #[default]
    Ocr,
    /// Local PDF text layer; no OCR service needed.
    TextLayer,
}

/// One `[classes.<name>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct ClassConfig {
    pub kind: ClassKind,
    /// Folder path under the drive root.
    pub folder: String,
    pub collection: String,
    #[serde(default)]
    pub include_globs: Option<Vec<String>>,
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default)]
    pub start_offset_minutes: Option<u64>,
    #[serde(default)]
    pub lookback_hours: Option<u64>,
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default)]
    pub low_confidence: Option<LowConfidencePolicy>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub vector_store: Option<VectorStoreConfig>,
    #[serde(default)]
    pub ocr: Option<OcrConfig>,
    #[serde(default)]
    pub extraction: ExtractionMode,
    /// Regulation records only: JSON field holding the domain key.
    #[serde(default)]
    pub key_field: Option<String>,
}

/// A class with every global default and override applied.
#[derive(Debug, Clone)]
pub struct ClassSettings {
    pub name: String,
    pub kind: ClassKind,
    pub folder: String,
    pub collection: String,
    pub include_globs: Vec<String>,
    pub interval: Duration,
    pub start_offset: Duration,
    pub initial_lookback: chrono::Duration,
    pub extraction: ExtractionMode,
    pub key_field: String,
    pub ocr: OcrConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
}

impl Config {
    /// Resolve every class, in name order.
    pub fn class_settings(&self) -> Vec<ClassSettings> {
        self.classes
            .iter()
            .enumerate()
            .map(|(position, (name, class))| self.resolve(position, name, class))
            .collect()
    }

    pub fn class(&self, name: &str) -> Option<ClassSettings> {
        self.classes
            .iter()
            .enumerate()
            .find(|(_, (class_name, _))| class_name.as_str() == name)
            .map(|(position, (name, class))| self.resolve(position, name, class))
    }

    fn resolve(&self, position: usize, name: &str, class: &ClassConfig) -> ClassSettings {
        let mut ocr = class.ocr.clone().unwrap_or_else(|| self.ocr.clone());
        if let Some(min) = class.min_confidence {
            ocr.min_confidence = min;
        }
        if let Some(policy) = class.low_confidence {
            ocr.low_confidence = policy;
        }

        let mut embedding = self.embedding.clone();
        if let Some(model) = &class.embedding_model {
            embedding.model = model.clone();
        }
        if let Some(dims) = class.dims {
            embedding.dims = dims;
        }

        let interval_minutes = class
            .interval_minutes
            .unwrap_or(self.scheduler.default_interval_minutes);
        let offset_minutes = class
            .start_offset_minutes
            .unwrap_or(2 * position as u64);
        let lookback_hours = class
            .lookback_hours
            .unwrap_or(self.scheduler.initial_lookback_hours);

        ClassSettings {
            name: name.to_string(),
            kind: class.kind,
            folder: class.folder.clone(),
            collection: class.collection.clone(),
            include_globs: class
                .include_globs
                .clone()
                .unwrap_or_else(|| class.kind.default_globs()),
            interval: Duration::from_secs(interval_minutes.saturating_mul(60)),
            start_offset: Duration::from_secs(offset_minutes.saturating_mul(60)),
            initial_lookback: chrono::Duration::hours(lookback_hours.min(MAX_LOOKBACK_HOURS) as i64),
            extraction: class.extraction,
            key_field: class
                .key_field
                .clone()
                .unwrap_or_else(|| "hs_code".to_string()),
            ocr,
            embedding,
            vector_store: class
                .vector_store
                .clone()
                .unwrap_or_else(|| self.vector_store.clone()),
        }
    }
}

/// One week.
const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Ten years.
const MAX_LOOKBACK_HOURS: u64 = 10 * 365 * 24;

fn check_at_most(key: &str, value: u64, max: u64) -> Result<()> {
    if value > max {
        bail!("{} must be at most {} (got {})", key, max, value);
    }
    Ok(())
}

/// Read a secret from the environment variable named by a config key.
pub fn read_secret(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("environment variable {} not set", var))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.classes.is_empty() {
        bail!("at least one [classes.<name>] table is required");
    }

    match config.embedding.provider.as_str() {
        "gemini" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be gemini or openai.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_input_chars == 0 {
        bail!("embedding.max_input_chars must be > 0");
    }
    if config.remote.drive_id.is_none() && config.remote.user_id.is_none() {
        bail!("remote: set drive_id or user_id");
    }
    if config.remote.page_size == 0 {
        bail!("remote.page_size must be > 0");
    }

    check_at_most(
        "scheduler.default_interval_minutes",
        config.scheduler.default_interval_minutes,
        MAX_INTERVAL_MINUTES,
    )?;
    check_at_most(
        "scheduler.initial_lookback_hours",
        config.scheduler.initial_lookback_hours,
        MAX_LOOKBACK_HOURS,
    )?;
    for (name, class) in &config.classes {
        let limits = [
            ("interval_minutes", class.interval_minutes, MAX_INTERVAL_MINUTES),
            ("start_offset_minutes", class.start_offset_minutes, MAX_INTERVAL_MINUTES),
            ("lookback_hours", class.lookback_hours, MAX_LOOKBACK_HOURS),
        ];
        for (key, value, max) in limits {
            if let Some(value) = value {
                check_at_most(&format!("classes.{}.{}", name, key), value, max)?;
            }
        }
    }

    for class in config.class_settings() {
        if class.name.contains(':') {
            bail!("class name '{}' must not contain ':'", class.name);
        }
        if class.embedding.dims == 0 {
            bail!("classes.{}: embedding dims must be > 0", class.name);
        }
        if class.interval.is_zero() {
            bail!("classes.{}: interval_minutes must be > 0", class.name);
        }
        if !(0.0..=1.0).contains(&class.ocr.min_confidence) {
            bail!("classes.{}: min_confidence must be in [0.0, 1.0]", class.name);
        }
        if class.include_globs.is_empty() {
            bail!("classes.{}: include_globs must not be empty", class.name);
        }
        if class.collection.trim().is_empty() {
            bail!("classes.{}: collection must not be empty", class.name);
        }
    }

    Ok(config)
}
