//! Local text extraction for Office files and PDF text layers.
//!
//! Covers the formats that need no OCR round trip: `.docx` and `.pptx`
//! text runs, PDF text layers, and `.xlsx` rows for spreadsheet-backed
//! classes. Everything reads from memory and is bounded against zip bombs.

use std::io::Read;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};

use docsync_core::models::{ExtractedText, ExtractionMeta, ExtractionMethod};
use docsync_core::PipelineError;

use crate::traits::{ExtractOptions, TextExtractor};

/// Maximum rows read from one worksheet.
const XLSX_MAX_ROWS: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Extracts text in-process, chosen by file extension.
pub struct LocalExtractor;

#[async_trait]
impl TextExtractor for LocalExtractor {
    async fn extract(
        &self,
        content: &[u8],
        file_name: &str,
        _options: &ExtractOptions,
    ) -> Result<ExtractedText, PipelineError> {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let bytes = content.to_vec();
        let (text, method) = run_blocking(file_name, move || match ext.as_str() {
            "pdf" => Ok((extract_pdf(&bytes)?, ExtractionMethod::TextLayer)),
            "docx" => Ok((extract_docx(&bytes)?, ExtractionMethod::Ooxml)),
            "pptx" => Ok((extract_pptx(&bytes)?, ExtractionMethod::Ooxml)),
            other => Err(PipelineError::extraction(format!(
                "no local extractor for '.{}' files",
                other
            ))),
        })
        .await?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::extraction(format!(
                "{} contains no extractable text",
                file_name
            )));
        }
        Ok(ExtractedText {
            text,
            method,
            meta: ExtractionMeta::default(),
        })
    }
}

/// Run a parser on the blocking pool.
///
/// The parsers here are CPU-bound and some (pdf-extract) panic on inputs
/// they do not understand. A panic fails only the document being parsed.
pub async fn run_blocking<T, F>(file_name: &str, parse: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(parse).await.map_err(|e| {
        let reason = if e.is_panic() {
            format!("parser crashed on {}", file_name)
        } else {
            format!("parser task for {} was cancelled", file_name)
        };
        PipelineError::extraction(reason)
    })?
}

fn ooxml_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::extraction(format!("OOXML extraction failed: {}", e))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, PipelineError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| PipelineError::extraction(format!("PDF text layer extraction failed: {}", e)))
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, PipelineError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_error)
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, PipelineError> {
    let entry = archive.by_name(name).map_err(ooxml_error)?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(ooxml_error)?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml_error(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Entry names with a numeric suffix (`prefix<N>.xml`), sorted by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    text_runs(&xml, " ")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = open_archive(bytes)?;
    let mut out = String::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = text_runs(&xml, " ")?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// Concatenate every `<*:t>` run, separated by `sep`.
fn text_runs(xml: &[u8], sep: &str) -> Result<String, PipelineError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_t = false,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(ooxml_error)?;
                if !out.is_empty() {
                    out.push_str(sep);
                }
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Spreadsheets ============

/// Rows of the first worksheet as strings, columns positioned by cell reference.
///
/// Shared strings and inline strings are resolved; numbers are returned as
/// written in the sheet. Rows with no non-empty cell are dropped.
pub fn read_sheet_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut archive = open_archive(bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let sheet = numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .next()
        .ok_or_else(|| ooxml_error("workbook has no worksheets"))?;
    let xml = read_zip_entry_bounded(&mut archive, &sheet, MAX_XML_ENTRY_BYTES)?;
    parse_sheet_rows(&xml, &shared)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, PipelineError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml_error)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default().trim().to_string()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Plain,
}

fn cell_kind(e: &BytesStart<'_>) -> CellKind {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"t" {
            return match attr.value.as_ref() {
                b"s" => CellKind::Shared,
                b"inlineStr" => CellKind::Inline,
                _ => CellKind::Plain,
            };
        }
    }
    CellKind::Plain
}

/// Zero-based column of a cell reference such as `"AB12"`.
fn cell_column(e: &BytesStart<'_>) -> Option<usize> {
    let attr = e.attributes().flatten().find(|a| a.key.as_ref() == b"r")?;
    column_index(&String::from_utf8_lossy(&attr.value))
}

fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for b in letters {
        index = index * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize;
    }
    Some(index - 1)
}

fn parse_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut rows = Vec::new();
    let mut row: Option<Vec<String>> = None;
    let mut column = 0usize;
    let mut kind = CellKind::Plain;
    let mut in_value = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row = Some(Vec::new()),
                b"c" => {
                    let next = row.as_ref().map(|r| r.len()).unwrap_or(0);
                    column = cell_column(&e).unwrap_or(next);
                    kind = cell_kind(&e);
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(ooxml_error)?;
                let value = match kind {
                    CellKind::Shared => raw
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                        .unwrap_or_default(),
                    _ => raw.trim().to_string(),
                };
                if let Some(cells) = row.as_mut() {
                    if cells.len() <= column {
                        cells.resize(column + 1, String::new());
                    }
                    cells[column].push_str(&value);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => kind = CellKind::Plain,
                b"row" => {
                    if let Some(cells) = row.take() {
                        if cells.iter().any(|c| !c.is_empty()) {
                            rows.push(cells);
                        }
                    }
                    if rows.len() >= XLSX_MAX_ROWS {
                        break;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
