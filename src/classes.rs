//! Document classes and record decoding.
//!
//! Each configured class has a [`ClassKind`] that decides three things:
//! which files are candidates by default, how the raw bytes become text
//! (an [`ExtractionRoute`]), and how one fetched document turns into one
//! or more [`ClassRecord`] values. A spreadsheet yields one record per
//! row; every other kind yields exactly one.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use docsync_core::models::{ExtractedText, ExtractionMeta, ExtractionMethod, RemoteDocument};
use docsync_core::PipelineError;

use crate::config::ExtractionMode;
use crate::extract::read_sheet_rows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    Regulation,
    Procedure,
    CaseArchive,
    General,
}

impl ClassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKind::Regulation => "regulation",
            ClassKind::Procedure => "procedure",
            ClassKind::CaseArchive => "case_archive",
            ClassKind::General => "general",
        }
    }

    pub fn default_globs(&self) -> Vec<String> {
        let globs: &[&str] = match self {
            ClassKind::Regulation => &["*.json"],
            ClassKind::Procedure => &["*.pdf"],
            ClassKind::CaseArchive => &["*.xlsx"],
            ClassKind::General => &["*.pdf", "*.pptx", "*.docx"],
        };
        globs.iter().map(|g| g.to_string()).collect()
    }

    /// How the bytes of `doc` become text for this kind.
    pub fn route(&self, doc: &RemoteDocument, mode: ExtractionMode) -> ExtractionRoute {
        let pdf_route = match mode {
            ExtractionMode::Ocr => ExtractionRoute::Ocr,
            ExtractionMode::TextLayer => ExtractionRoute::Local,
        };
        match self {
            ClassKind::Regulation => ExtractionRoute::Structured,
            ClassKind::CaseArchive => ExtractionRoute::Spreadsheet,
            ClassKind::Procedure => pdf_route,
            ClassKind::General => match doc.meta().extension().as_deref() {
                Some("pdf") => pdf_route,
                _ => ExtractionRoute::Local,
            },
        }
    }

    /// Turn a fetched document into records.
    ///
    /// `extracted` must be present for the [`ExtractionRoute::Ocr`] and
    /// [`ExtractionRoute::Local`] routes. Rows of a spreadsheet that cannot
    /// be used are returned in [`Decoded::rejected`] so the rest of the
    /// sheet still goes through; a document that cannot be read at all is
    /// an error.
    pub fn decode(
        &self,
        doc: &RemoteDocument,
        extracted: Option<ExtractedText>,
        key_field: &str,
    ) -> Result<Decoded, PipelineError> {
        match self {
            ClassKind::Regulation => decode_regulation(doc, key_field).map(Decoded::single),
            ClassKind::CaseArchive => decode_case_sheet(doc),
            ClassKind::Procedure => {
                let text = require_text(doc, extracted)?;
                Ok(Decoded::single(ClassRecord::Procedure(ProcedureRecord::new(
                    doc.meta().stem(),
                    text,
                ))))
            }
            ClassKind::General => {
                let text = require_text(doc, extracted)?;
                Ok(Decoded::single(ClassRecord::General(GeneralRecord {
                    key: doc.meta().stem().to_string(),
                    file_type: doc.meta().extension().unwrap_or_default(),
                    text: text.text,
                    extraction: ExtractionInfo {
                        method: text.method,
                        meta: text.meta,
                    },
                })))
            }
        }
    }
}

impl std::fmt::Display for ClassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionRoute {
    /// Content is already structured; no extraction.
    Structured,
    /// Send to the OCR service.
    Ocr,
    /// Parse locally (PDF text layer, OOXML).
    Local,
    /// Parse spreadsheet rows locally.
    Spreadsheet,
}

#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<ClassRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl Decoded {
    fn single(record: ClassRecord) -> Self {
        Self {
            records: vec![record],
            rejected: Vec::new(),
        }
    }
}

/// Part of a document that could not become a record.
#[derive(Debug)]
pub struct RejectedRecord {
    pub key: String,
    pub error: PipelineError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionInfo {
    pub method: ExtractionMethod,
    pub meta: ExtractionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum ClassRecord {
    Regulation(RegulationRecord),
    Procedure(ProcedureRecord),
    Case(CaseRecord),
    General(GeneralRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegulationRecord {
    pub hs_code: String,
    pub hs_parent_uraian: Vec<String>,
    /// The source JSON object as published.
    pub document: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureRecord {
    pub key: String,
    /// `IK` or `SOP`, from the filename prefix.
    pub doc_type: Option<String>,
    pub title: String,
    pub text: String,
    pub extraction: ExtractionInfo,
}

impl ProcedureRecord {
    fn new(stem: &str, extracted: ExtractedText) -> Self {
        let upper = stem.to_ascii_uppercase();
        let doc_type = ["IK", "SOP"]
            .iter()
            .find(|prefix| {
                upper.starts_with(*prefix) && upper[prefix.len()..].starts_with(['_', '-', ' '])
            })
            .map(|prefix| prefix.to_string());
        let title = extracted
            .text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(stem)
            .to_string();
        Self {
            key: stem.to_string(),
            doc_type,
            title,
            text: extracted.text,
            extraction: ExtractionInfo {
                method: extracted.method,
                meta: extracted.meta,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseRecord {
    pub case_no: String,
    pub date: String,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneralRecord {
    pub key: String,
    pub file_type: String,
    pub text: String,
    pub extraction: ExtractionInfo,
}

impl ClassRecord {
    /// Identifier within the class; namespaced by the orchestrator.
    pub fn domain_key(&self) -> &str {
        match self {
            ClassRecord::Regulation(r) => &r.hs_code,
            ClassRecord::Procedure(r) => &r.key,
            ClassRecord::Case(r) => &r.case_no,
            ClassRecord::General(r) => &r.key,
        }
    }

    /// The text that gets embedded and fingerprinted.
    pub fn embed_text(&self) -> String {
        match self {
            ClassRecord::Regulation(r) => {
                format!("{} {}", r.hs_parent_uraian.join(" "), r.hs_code)
                    .trim()
                    .to_string()
            }
            ClassRecord::Procedure(r) => r.text.clone(),
            ClassRecord::Case(r) => format!("Q: {} A: {}", r.question, r.answer),
            ClassRecord::General(r) => r.text.clone(),
        }
    }

    pub fn extraction(&self) -> Option<&ExtractionInfo> {
        match self {
            ClassRecord::Procedure(r) => Some(&r.extraction),
            ClassRecord::General(r) => Some(&r.extraction),
            ClassRecord::Regulation(_) | ClassRecord::Case(_) => None,
        }
    }

    /// Class-specific payload fields.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            ClassRecord::Regulation(r) => {
                fields.insert("hs_code".into(), Value::from(r.hs_code.clone()));
                fields.insert(
                    "hs_parent_uraian".into(),
                    Value::from(r.hs_parent_uraian.clone()),
                );
                fields.insert("document".into(), Value::Object(r.document.clone()));
            }
            ClassRecord::Procedure(r) => {
                fields.insert("doc_type".into(), Value::from(r.doc_type.clone()));
                fields.insert("title".into(), Value::from(r.title.clone()));
                fields.insert("text".into(), Value::from(r.text.clone()));
            }
            ClassRecord::Case(r) => {
                fields.insert("case_no".into(), Value::from(r.case_no.clone()));
                fields.insert("date".into(), Value::from(r.date.clone()));
                fields.insert("question".into(), Value::from(r.question.clone()));
                fields.insert("answer".into(), Value::from(r.answer.clone()));
            }
            ClassRecord::General(r) => {
                fields.insert("file_type".into(), Value::from(r.file_type.clone()));
                fields.insert("text".into(), Value::from(r.text.clone()));
            }
        }
        fields
    }
}

fn require_text(
    doc: &RemoteDocument,
    extracted: Option<ExtractedText>,
) -> Result<ExtractedText, PipelineError> {
    extracted.ok_or_else(|| {
        PipelineError::extraction(format!("no text extracted from {}", doc.meta().name))
    })
}

fn decode_regulation(doc: &RemoteDocument, key_field: &str) -> Result<ClassRecord, PipelineError> {
    let value: Value = serde_json::from_slice(doc.content()).map_err(|e| {
        PipelineError::InvalidDocument(format!("{}: invalid JSON: {}", doc.meta().name, e))
    })?;
    let Value::Object(document) = value else {
        return Err(PipelineError::InvalidDocument(format!(
            "{}: expected a JSON object",
            doc.meta().name
        )));
    };

    let from_field = match document.get(key_field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let hs_code = if from_field.is_empty() {
        doc.meta().stem().to_string()
    } else {
        from_field
    };
    if hs_code.is_empty() {
        return Err(PipelineError::InvalidDocument(format!(
            "{}: no {} and no usable filename",
            doc.meta().name,
            key_field
        )));
    }

    let hs_parent_uraian = match document.get("hs_parent_uraian") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };

    Ok(ClassRecord::Regulation(RegulationRecord {
        hs_code,
        hs_parent_uraian,
        document,
    }))
}

const CASE_COLUMNS: [&str; 4] = ["NO", "DATE", "QUESTION", "ANSWER"];

fn decode_case_sheet(doc: &RemoteDocument) -> Result<Decoded, PipelineError> {
    let rows = read_sheet_rows(doc.content())?;
    let mut rows = rows.into_iter();
    let header = rows.next().ok_or_else(|| {
        PipelineError::InvalidDocument(format!("{}: spreadsheet is empty", doc.meta().name))
    })?;

    let mut positions = [0usize; 4];
    for (slot, column) in positions.iter_mut().zip(CASE_COLUMNS) {
        *slot = header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                PipelineError::InvalidDocument(format!(
                    "{}: missing {} column",
                    doc.meta().name,
                    column
                ))
            })?;
    }
    let [no_at, date_at, question_at, answer_at] = positions;

    let mut decoded = Decoded::default();
    for (index, row) in rows.enumerate() {
        let cell = |at: usize| row.get(at).map(|c| c.trim()).unwrap_or("");
        // Header is row 1.
        let row_number = index + 2;
        let case_no = normalize_case_no(cell(no_at));
        let question = cell(question_at);
        let answer = cell(answer_at);

        if case_no.is_empty() {
            decoded.rejected.push(RejectedRecord {
                key: format!("{}#row{}", doc.meta().stem(), row_number),
                error: PipelineError::InvalidDocument(format!("row {} has no NO", row_number)),
            });
            continue;
        }
        if question.is_empty() || answer.is_empty() {
            decoded.rejected.push(RejectedRecord {
                key: case_no,
                error: PipelineError::InvalidDocument(format!(
                    "row {} is missing QUESTION or ANSWER",
                    row_number
                )),
            });
            continue;
        }

        decoded.records.push(ClassRecord::Case(CaseRecord {
            case_no,
            date: normalize_date(cell(date_at)),
            question: question.to_string(),
            answer: answer.to_string(),
        }));
    }
    Ok(decoded)
}

/// Numeric cells come back as `12` or `12.0`; both mean case 12.
fn normalize_case_no(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", n as i64),
        _ => raw.to_string(),
    }
}

/// Convert an Excel date serial to `YYYY-MM-DD`; leave anything else alone.
fn normalize_date(raw: &str) -> String {
    let Ok(serial) = raw.parse::<f64>() else {
        return raw.to_string();
    };
    if !(1.0..2_958_466.0).contains(&serial) {
        return raw.to_string();
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|base| base.checked_add_signed(Duration::days(serial.trunc() as i64)))
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.to_string())
}
