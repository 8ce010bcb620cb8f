//! Primary converter: HTML and plain text to Markdown through `htmd`.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use coursepipe_shared::{ConverterKind, PipelineError, RawPayload, Result, count_tokens};

use crate::{Candidate, DocumentConverter, cleanup, mime};

/// Below this many words of visible text, a page that embeds a document
/// (iframe, object, embed) is assumed to carry its content in the embed.
const EMBED_TEXT_WORDS: usize = 30;

/// Confidence reported when the visible text is mostly an embed wrapper.
const EMBED_CONFIDENCE: f32 = 0.3;

/// Deterministic structural converter for HTML, Markdown, and plain text.
#[derive(Debug, Clone, Default)]
pub struct PrimaryConverter {
    /// Origin used to absolutize course-relative links.
    base_url: Option<Url>,
}

impl PrimaryConverter {
    pub fn new(base_url: Option<Url>) -> Self {
        Self { base_url }
    }

    /// Convert an HTML document to cleaned Markdown.
    pub fn html_to_markdown(&self, html: &str) -> Result<String> {
        let content = extract_content_html(html);
        let content = preprocess_tables(&content);

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "iframe", "noscript", "svg", "object", "embed",
            ])
            .build();
        let raw = converter
            .convert(&content)
            .map_err(|e| PipelineError::Conversion(format!("htmd conversion failed: {e}")))?;
        debug!(raw_len = raw.len(), "htmd conversion complete");

        Ok(cleanup::run_pipeline(&raw, self.base_url.as_ref()))
    }
}

#[async_trait]
impl DocumentConverter for PrimaryConverter {
    fn name(&self) -> &'static str {
        "htmd"
    }

    fn kind(&self) -> ConverterKind {
        ConverterKind::Primary
    }

    #[instrument(skip_all, fields(resource_id = %payload.resource_id, mime = %payload.mime_type))]
    async fn convert(&self, payload: &RawPayload) -> Result<Candidate> {
        let format = mime::classify(payload);
        let text = match format {
            mime::Format::Html | mime::Format::PlainText | mime::Format::Markdown => {
                String::from_utf8_lossy(&payload.bytes).into_owned()
            }
            other => {
                return Err(PipelineError::Conversion(format!(
                    "primary converter does not handle {other} ({})",
                    payload.mime_type
                )));
            }
        };

        if format != mime::Format::Html {
            return Ok(Candidate {
                markdown: cleanup::run_pipeline(&text, None),
                confidence: Some(1.0),
                warnings: Vec::new(),
            });
        }

        let markdown = self.html_to_markdown(&text)?;
        let confidence = html_confidence(&text);
        let mut warnings = Vec::new();
        if confidence < 1.0 {
            warnings.push("page content is mostly an embedded document".to_string());
        }
        Ok(Candidate {
            markdown,
            confidence: Some(confidence),
            warnings,
        })
    }
}

/// Full confidence unless the page is a thin wrapper around an embed.
fn html_confidence(html: &str) -> f32 {
    let doc = Html::parse_document(html);
    let Ok(embed_sel) = Selector::parse("iframe, object, embed") else {
        return 1.0;
    };
    let has_embed = doc.select(&embed_sel).next().is_some();
    let words = count_tokens(&doc.root_element().text().collect::<Vec<_>>().join(" "));
    if has_embed && words < EMBED_TEXT_WORDS {
        EMBED_CONFIDENCE
    } else {
        1.0
    }
}

// ---------------------------------------------------------------------------
// Content extraction
// ---------------------------------------------------------------------------

/// The main content of a document, falling back to `<body>`.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    let selectors = ["main", "[role=\"main\"]", "body"];
    for sel in selectors {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }
    html.to_string()
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Replace `<table>` elements with Markdown pipe tables ahead of htmd,
/// which leaves tables as text runs.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let Ok(table_sel) = Selector::parse("table") else {
        return html.to_string();
    };

    if doc.select(&table_sel).next().is_none() {
        return html.to_string();
    }

    // Replace within the re-serialized fragment so `table.html()` matches.
    let mut out = doc.root_element().inner_html();
    for table in doc.select(&table_sel) {
        // Nested tables are flattened into their outer table's cells.
        if table.ancestors().filter_map(ElementRef::wrap).any(|a| a.value().name() == "table") {
            continue;
        }
        out = out.replacen(&table.html(), &table_to_markdown(&table), 1);
    }
    out
}

fn table_to_markdown(table: &ElementRef) -> String {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return String::new();
    };

    let mut rows: Vec<Vec<String>> = table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| {
                    cell.text()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .replace('|', "\\|")
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(width, String::new());
    }

    let mut md = String::from("\n\n");
    for (i, row) in rows.iter().enumerate() {
        md.push_str(&format!("| {} |\n", row.join(" | ")));
        if i == 0 {
            md.push_str(&format!("|{}\n", " --- |".repeat(width)));
        }
    }
    md.push('\n');
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepipe_shared::ResourceId;

    fn html_payload(html: &str) -> RawPayload {
        RawPayload::new(ResourceId::from("page-x"), "text/html", html.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn converts_canvas_page_body() {
        let html = r#"<html><body>
            <h1>Week 1</h1>
            <div class="user_content"><h2>Readings</h2><p>Chapter <strong>one</strong>.</p>
            <p><a href="/courses/1/files/9">Slides</a></p></div>
        </body></html>"#;
        let converter = PrimaryConverter::new(Url::parse("https://canvas.example.edu/").ok());
        let candidate = converter.convert(&html_payload(html)).await.unwrap();

        assert!(candidate.markdown.contains("## Readings"));
        assert!(candidate.markdown.contains("**one**"));
        assert!(candidate.markdown.contains("(https://canvas.example.edu/courses/1/files/9)"));
        assert_eq!(candidate.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn tables_become_pipe_tables() {
        let html = "<body><table><tr><th>Week</th><th>Topic</th></tr><tr><td>1</td><td>Intro</td></tr></table></body>";
        let candidate = PrimaryConverter::default()
            .convert(&html_payload(html))
            .await
            .unwrap();
        assert!(candidate.markdown.contains("| Week | Topic |"));
        assert!(candidate.markdown.contains("| 1 | Intro |"));
    }

    #[tokio::test]
    async fn embed_wrapper_scores_low() {
        let html = r#"<body><p>See below.</p><iframe src="https://docs.example.com/x"></iframe></body>"#;
        let candidate = PrimaryConverter::default()
            .convert(&html_payload(html))
            .await
            .unwrap();
        assert_eq!(candidate.confidence, Some(EMBED_CONFIDENCE));
        assert_eq!(candidate.warnings.len(), 1);
    }

    #[tokio::test]
    async fn rejects_binary_formats() {
        let payload = RawPayload::new(
            ResourceId::from("file-1"),
            "application/pdf",
            b"%PDF-1.4".to_vec(),
        );
        let err = PrimaryConverter::default().convert(&payload).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let payload = RawPayload::new(
            ResourceId::from("file-2"),
            "text/plain",
            b"Office hours: Tuesday\n".to_vec(),
        );
        let candidate = PrimaryConverter::default().convert(&payload).await.unwrap();
        assert_eq!(candidate.markdown, "Office hours: Tuesday\n");
    }
}
