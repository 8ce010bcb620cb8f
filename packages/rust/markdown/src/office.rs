//! Secondary converter: text extraction from PDFs and Office Open XML files.
//!
//! PDFs go through `pdf-extract` on a blocking thread and are scored with a
//! character-ratio heuristic; a noisy text layer still yields a candidate,
//! just one the confidence gate will usually pass over. DOCX and PPTX are zip
//! containers whose XML parts are scanned for paragraphs and runs.

use std::io::{Cursor, Read};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};

use coursepipe_shared::{ConverterKind, PipelineError, RawPayload, Result};

use crate::mime::{self, Format};
use crate::{Candidate, DocumentConverter, cleanup};

const PDF_MIN_LEN: usize = 150;
const PDF_MIN_ASCII_RATIO: f64 = 0.7;
const PDF_MIN_LETTER_RATIO: f64 = 0.3;

const PDF_GOOD_CONFIDENCE: f32 = 0.9;
const PDF_NOISY_CONFIDENCE: f32 = 0.2;
const OFFICE_CONFIDENCE: f32 = 0.85;

/// Layout-aware extraction for binary document formats.
#[derive(Debug, Clone, Default)]
pub struct SecondaryConverter;

#[async_trait]
impl DocumentConverter for SecondaryConverter {
    fn name(&self) -> &'static str {
        "document-extract"
    }

    fn kind(&self) -> ConverterKind {
        ConverterKind::Fallback
    }

    #[instrument(skip_all, fields(resource_id = %payload.resource_id, mime = %payload.mime_type))]
    async fn convert(&self, payload: &RawPayload) -> Result<Candidate> {
        match mime::classify(payload) {
            Format::Pdf => convert_pdf(payload.bytes.clone()).await,
            Format::Docx => {
                let markdown = docx_to_markdown(&payload.bytes)?;
                Ok(office_candidate(markdown))
            }
            Format::Pptx => {
                let markdown = pptx_to_markdown(&payload.bytes)?;
                Ok(office_candidate(markdown))
            }
            other => Err(PipelineError::Conversion(format!(
                "secondary converter does not handle {other} ({})",
                payload.mime_type
            ))),
        }
    }
}

fn office_candidate(markdown: String) -> Candidate {
    Candidate {
        markdown: cleanup::run_pipeline(&markdown, None),
        confidence: Some(OFFICE_CONFIDENCE),
        warnings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// PDF
// ---------------------------------------------------------------------------

async fn convert_pdf(bytes: Vec<u8>) -> Result<Candidate> {
    let text = pdf_text(bytes).await?;
    if text.is_empty() {
        return Err(PipelineError::Conversion("PDF has no text layer".into()));
    }

    let markdown = cleanup::run_pipeline(&reflow(&text), None);
    if looks_good_enough(&text) {
        Ok(Candidate {
            markdown,
            confidence: Some(PDF_GOOD_CONFIDENCE),
            warnings: Vec::new(),
        })
    } else {
        debug!(len = text.len(), "PDF text layer looks noisy");
        Ok(Candidate {
            markdown,
            confidence: Some(PDF_NOISY_CONFIDENCE),
            warnings: vec!["PDF text layer is short or noisy".to_string()],
        })
    }
}

/// Raw text layer of a PDF, trimmed. Runs off the async executor.
pub(crate) async fn pdf_text(bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&bytes).map(|s| s.trim().to_string())
    })
    .await
    .map_err(|e| PipelineError::Conversion(format!("PDF extraction task failed: {e}")))?
    .map_err(|e| PipelineError::Conversion(format!("failed to extract text from PDF: {e}")))
}

/// Long enough, mostly ASCII, and mostly letters.
fn looks_good_enough(text: &str) -> bool {
    if text.len() < PDF_MIN_LEN {
        return false;
    }
    let total = text.chars().count() as f64;
    let ascii = text.chars().filter(char::is_ascii).count() as f64;
    let letters = text.chars().filter(|c| c.is_alphabetic()).count() as f64;
    ascii / total >= PDF_MIN_ASCII_RATIO && letters / total > PDF_MIN_LETTER_RATIO
}

/// Join hard-wrapped lines into paragraphs, keeping list and heading lines
/// on their own.
fn reflow(input: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();

    let flush = |buffer: &mut Vec<&str>, paragraphs: &mut Vec<String>| {
        if !buffer.is_empty() {
            paragraphs.push(buffer.join(" "));
            buffer.clear();
        }
    };

    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut buffer, &mut paragraphs);
        } else if is_structural_line(trimmed) {
            flush(&mut buffer, &mut paragraphs);
            paragraphs.push(trimmed.to_string());
        } else {
            buffer.push(trimmed);
        }
    }
    flush(&mut buffer, &mut paragraphs);

    paragraphs.join("\n\n")
}

fn is_structural_line(line: &str) -> bool {
    static NUMBERED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\d+[.)]\s").expect("valid regex"));
    line.starts_with('#')
        || line.starts_with("- ")
        || line.starts_with("* ")
        || line.starts_with('•')
        || line.starts_with('>')
        || line.starts_with("| ")
        || NUMBERED_RE.is_match(line)
}

// ---------------------------------------------------------------------------
// Office Open XML
// ---------------------------------------------------------------------------

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>> {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::Conversion(format!("not a valid Office container: {e}")))
}

fn read_part(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String> {
    let mut part = archive
        .by_name(name)
        .map_err(|e| PipelineError::Conversion(format!("missing part {name}: {e}")))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|e| PipelineError::Conversion(format!("unreadable part {name}: {e}")))?;
    Ok(xml)
}

static RUN_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:w|a):t(?:\s[^>]*)?>([^<]*)</(?:w|a):t>|<(?:w|a):(?:tab|br)\b[^>]*/>")
        .expect("valid regex")
});

/// Concatenated text runs of one XML paragraph.
fn paragraph_text(xml: &str) -> String {
    let mut text = String::new();
    for caps in RUN_TEXT_RE.captures_iter(xml) {
        match caps.get(1) {
            Some(run) => text.push_str(&unescape_xml(run.as_str())),
            None => text.push(' '),
        }
    }
    text.trim().to_string()
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Paragraphs of `word/document.xml`; `HeadingN` styles become headings and
/// numbered paragraphs become list items.
fn docx_to_markdown(bytes: &[u8]) -> Result<String> {
    static PARA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("valid regex"));
    static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"<w:pStyle w:val="(?:Heading|heading )(\d)""#).expect("valid regex")
    });
    static TITLE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"<w:pStyle w:val="Title""#).expect("valid regex"));

    let mut archive = open_zip(bytes)?;
    let xml = read_part(&mut archive, "word/document.xml")?;

    let mut blocks = Vec::new();
    for para in PARA_RE.find_iter(&xml) {
        let para = para.as_str();
        let text = paragraph_text(para);
        if text.is_empty() {
            continue;
        }
        let block = if TITLE_RE.is_match(para) {
            format!("# {text}")
        } else if let Some(level) = STYLE_RE
            .captures(para)
            .and_then(|c| c[1].parse::<usize>().ok())
        {
            format!("{} {text}", "#".repeat((level + 1).min(6)))
        } else if para.contains("<w:numPr>") {
            format!("- {text}")
        } else {
            text
        };
        blocks.push(block);
    }

    Ok(blocks.join("\n\n"))
}

/// Slide text in slide order, one section per slide.
fn pptx_to_markdown(bytes: &[u8]) -> Result<String> {
    static SLIDE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").expect("valid regex"));
    static PARA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<a:p>.*?</a:p>|<a:p\s.*?</a:p>").expect("valid regex"));

    let mut archive = open_zip(bytes)?;
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = SLIDE_RE.captures(name)?[1].parse().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort_by_key(|(n, _)| *n);

    let mut sections = Vec::new();
    for (number, name) in slides {
        let xml = read_part(&mut archive, &name)?;
        let lines: Vec<String> = PARA_RE
            .find_iter(&xml)
            .map(|p| paragraph_text(p.as_str()))
            .filter(|t| !t.is_empty())
            .collect();
        let Some((title, rest)) = lines.split_first() else {
            continue;
        };
        let mut section = format!("## Slide {number}: {title}");
        for line in rest {
            section.push_str("\n\n");
            section.push_str(line);
        }
        sections.push(section);
    }

    Ok(sections.join("\n\n"))
}
