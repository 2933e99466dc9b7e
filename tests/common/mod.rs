//! Fakes shared by the integration tests: a scripted drive folder, a
//! deterministic embedder, and a scripted OCR service.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, Semaphore};

use docsync::config::{parse_config, ClassSettings, Config};
use docsync::ingest::PipelineOrchestrator;
use docsync::runlog::RunLog;
use docsync::traits::{DocumentSource, ExtractOptions, Listing, TextExtractor};
use docsync_core::embedding::EmbeddingGenerator;
use docsync_core::index::{InMemoryIndex, VectorIndex};
use docsync_core::models::{
    ExtractedText, ExtractionMeta, ExtractionMethod, RemoteDocument, RemoteDocumentMeta,
};
use docsync_core::PipelineError;

pub const DIMS: usize = 8;

pub const CONFIG: &str = r#"
[db]
path = "./unused.sqlite"

[remote]
tenant_id = "t"
client_id = "c"
user_id = "u"

[embedding]
provider = "gemini"
model = "hash-embed"
dims = 8
batch_size = 2

[classes.insw]
kind = "regulation"
folder = "INSW/json"
collection = "insw"

[classes.archive]
kind = "regulation"
folder = "Archive/json"
collection = "archive"

[classes.sop]
kind = "procedure"
folder = "SOP"
collection = "sop"

[classes.handbook]
kind = "general"
folder = "Docs"
collection = "handbook"
extraction = "text_layer"

[classes.sop_strict]
kind = "procedure"
folder = "SOP"
collection = "sop_strict"
min_confidence = 0.8
low_confidence = "skip"
"#;

pub fn config() -> Config {
    parse_config(CONFIG).unwrap()
}

pub fn settings(class: &str) -> ClassSettings {
    config().class(class).unwrap()
}

pub fn meta(name: &str, last_modified: DateTime<Utc>) -> RemoteDocumentMeta {
    RemoteDocumentMeta {
        external_id: format!("id-{}", name),
        name: name.to_string(),
        last_modified,
        size: None,
        web_url: Some(format!("https://drive.example/{}", name)),
    }
}

/// A regulation JSON document.
pub fn regulation(hs_code: &str, uraian: &[&str]) -> Vec<u8> {
    serde_json::json!({
        "hs_code": hs_code,
        "hs_parent_uraian": uraian,
        "notes": "initial",
    })
    .to_string()
    .into_bytes()
}

/// A `.docx` whose body is `text`.
pub fn docx(text: &str) -> Vec<u8> {
    use std::io::Write;

    let body = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
        text
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(body.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

/// A well-formed PDF (valid xref) that the text-layer parser cannot
/// handle: its Type0 font has no `DescendantFonts`.
pub fn pdf_with_broken_font() -> Vec<u8> {
    let stream = "BT /F1 12 Tf 72 712 Td (Hello) Tj ET";
    let objects = [
        "<</Type/Catalog/Pages 2 0 R>>".to_string(),
        "<</Type/Pages/Kids[3 0 R]/Count 1>>".to_string(),
        "<</Type/Page/Parent 2 0 R/MediaBox[0 0 612 792]/Resources<</Font<</F1 4 0 R>>>>/Contents 5 0 R>>".to_string(),
        "<</Type/Font/Subtype/Type0/BaseFont/Foo/Encoding/Identity-H>>".to_string(),
        format!("<</Length {}>>\nstream\n{}\nendstream", stream.len(), stream),
    ];
    let mut pdf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.push_str(&format!("{} 0 obj\n{}\nendobj\n", i + 1, body));
    }
    let xref_at = pdf.len();
    pdf.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for offset in offsets {
        pdf.push_str(&format!("{:010} 00000 n \n", offset));
    }
    pdf.push_str(&format!(
        "trailer\n<</Size {}/Root 1 0 R>>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    ));
    pdf.into_bytes()
}

// ============ Source ============

/// An in-memory drive folder. Listing filters by `last_modified`, like
/// the Graph connector does.
#[derive(Default)]
pub struct ScriptedSource {
    files: Mutex<BTreeMap<String, (RemoteDocumentMeta, Vec<u8>)>>,
    failing: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    /// When set, `list_candidates` signals `entered` and waits for a permit.
    gate: Option<(Arc<Notify>, Arc<Semaphore>)>,
    panic_on_list: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose listing blocks until `release` adds a permit.
    pub fn gated() -> (Self, Arc<Notify>, Arc<Semaphore>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Semaphore::new(0));
        let source = Self {
            gate: Some((Arc::clone(&entered), Arc::clone(&release))),
            ..Self::default()
        };
        (source, entered, release)
    }

    pub fn put(&self, name: &str, content: Vec<u8>) {
        self.put_at(name, content, Utc::now() - Duration::minutes(5));
    }

    pub fn put_at(&self, name: &str, content: Vec<u8>, last_modified: DateTime<Utc>) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), (meta(name, last_modified), content));
    }

    /// Downloads of `name` fail with a transient I/O error.
    pub fn fail_fetch(&self, name: &str) {
        self.failing.lock().unwrap().push(name.to_string());
    }

    pub fn panic_on_list(&self, panic: bool) {
        self.panic_on_list.store(panic, Ordering::SeqCst);
    }

    pub fn remote_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for ScriptedSource {
    fn label(&self) -> &str {
        "scripted"
    }

    async fn list_candidates(&self, since: DateTime<Utc>) -> Result<Listing, PipelineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_list.load(Ordering::SeqCst) {
            panic!("listing exploded");
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            let permit = release
                .acquire()
                .await
                .map_err(|e| PipelineError::Listing(e.to_string()))?;
            permit.forget();
        }
        let candidates = self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|(meta, _)| meta.last_modified >= since)
            .map(|(meta, _)| meta.clone())
            .collect();
        Ok(Listing {
            candidates,
            errors: Vec::new(),
        })
    }

    async fn fetch(&self, meta: &RemoteDocumentMeta) -> Result<RemoteDocument, PipelineError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&meta.name) {
            return Err(PipelineError::TransientIo(format!(
                "download of {} failed",
                meta.name
            )));
        }
        let files = self.files.lock().unwrap();
        let (stored, content) = files
            .get(&meta.name)
            .ok_or_else(|| PipelineError::TransientIo(format!("{} vanished", meta.name)))?;
        Ok(RemoteDocument::new(stored.clone(), content.clone()))
    }
}

// ============ Embedder ============

/// Deterministic vectors from a SHA-256 of the input. Any text containing
/// `POISON` fails, alone or inside a batch.
pub struct HashEmbedder {
    max_chars: usize,
    pub batch_calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_max_chars(8000)
    }

    pub fn with_max_chars(max_chars: usize) -> Self {
        Self {
            max_chars,
            batch_calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        digest
            .iter()
            .take(DIMS)
            .map(|b| *b as f32 / 255.0 + 0.01)
            .collect()
    }
}

#[async_trait]
impl EmbeddingGenerator for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embed"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn max_input_chars(&self) -> usize {
        self.max_chars
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.contains("POISON")) {
            return Err(PipelineError::Embedding("model refused input".into()));
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

// ============ OCR ============

/// Treats the document bytes as the recognized text. Content starting
/// with `LOWCONF` comes back with confidence 0.3; content starting with
/// `UNREADABLE` fails.
pub struct ScriptedOcr;

#[async_trait]
impl TextExtractor for ScriptedOcr {
    async fn extract(
        &self,
        content: &[u8],
        file_name: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractedText, PipelineError> {
        let text = String::from_utf8_lossy(content).to_string();
        if text.starts_with("UNREADABLE") {
            return Err(PipelineError::extraction(format!(
                "{}: OCR returned no text",
                file_name
            )));
        }
        let confidence = if text.starts_with("LOWCONF") { 0.3 } else { 0.95 };
        Ok(ExtractedText {
            text,
            method: ExtractionMethod::Ocr,
            meta: ExtractionMeta {
                page_count: Some(1),
                confidence: Some(confidence),
                language: Some(options.lang.clone()),
                low_confidence: confidence < options.min_confidence,
            },
        })
    }
}

// ============ Assembly ============

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub embedder: Arc<HashEmbedder>,
    pub index: Arc<InMemoryIndex>,
    pub pipeline: Arc<PipelineOrchestrator>,
}

pub fn harness(class: &str, run_log: Arc<dyn RunLog>) -> Harness {
    harness_with(class, ScriptedSource::new(), HashEmbedder::new(), run_log)
}

pub fn harness_with(
    class: &str,
    source: ScriptedSource,
    embedder: HashEmbedder,
    run_log: Arc<dyn RunLog>,
) -> Harness {
    let source = Arc::new(source);
    let embedder = Arc::new(embedder);
    let index = Arc::new(InMemoryIndex::new());
    let pipeline = pipeline(
        class,
        Arc::clone(&source),
        Arc::clone(&embedder),
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        run_log,
    );
    Harness {
        source,
        embedder,
        index,
        pipeline,
    }
}

pub fn pipeline(
    class: &str,
    source: Arc<ScriptedSource>,
    embedder: Arc<HashEmbedder>,
    index: Arc<dyn VectorIndex>,
    run_log: Arc<dyn RunLog>,
) -> Arc<PipelineOrchestrator> {
    Arc::new(
        PipelineOrchestrator::new(settings(class), source, embedder, index, run_log)
            .with_ocr(Arc::new(ScriptedOcr)),
    )
}
