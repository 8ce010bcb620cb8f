//! LLM-assisted converter over an OpenAI-compatible chat completions API
//! (OpenRouter by default).
//!
//! The payload is reduced to text first (HTML through the primary pipeline,
//! PDFs and Office files through the secondary extractors), truncated, and
//! sent with a fixed instruction to return clean Markdown.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use coursepipe_shared::{
    ConverterKind, LlmSection, PipelineError, RawPayload, Result, resolve_secret,
};

use crate::html::PrimaryConverter;
use crate::mime::{self, Format};
use crate::{Candidate, DocumentConverter, cleanup, office};

const SYSTEM_PROMPT: &str = "You convert course material into clean Markdown. Preserve headings, lists, tables, and the original reading order. Do not summarize, do not add commentary, and do not wrap the answer in a code block.";

/// Converter that asks a language model to restructure extracted text.
pub struct LlmConverter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_input_chars: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

impl LlmConverter {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_input_chars: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build LLM client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_input_chars,
        })
    }

    /// Build from the `[llm]` section, reading the key from its env var.
    pub fn from_config(section: &LlmSection) -> Result<Self> {
        let api_key = resolve_secret(&section.api_key_env, "LLM fallback")?;
        Self::new(
            section.endpoint.clone(),
            api_key,
            section.model.clone(),
            Duration::from_secs(section.timeout_secs),
            section.max_input_chars,
        )
    }

    async fn complete(&self, input: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: input,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Conversion(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(PipelineError::Conversion(format!(
                "LLM endpoint returned HTTP {status}: {snippet}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Conversion(format!("malformed LLM response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::Conversion("LLM response had no content".into()))
    }
}

#[async_trait]
impl DocumentConverter for LlmConverter {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn kind(&self) -> ConverterKind {
        ConverterKind::Llm
    }

    #[instrument(skip_all, fields(resource_id = %payload.resource_id, model = %self.model))]
    async fn convert(&self, payload: &RawPayload) -> Result<Candidate> {
        let mut warnings = vec![format!("converted by language model {}", self.model)];

        let text = extract_text(payload).await?;
        if text.trim().is_empty() {
            return Err(PipelineError::Conversion(
                "no extractable text to send to the LLM".into(),
            ));
        }
        let input: String = text.chars().take(self.max_input_chars).collect();
        if input.len() < text.len() {
            warnings.push(format!(
                "input truncated to {} characters",
                self.max_input_chars
            ));
        }

        let started = Instant::now();
        let answer = self.complete(&input).await?;
        debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            output_len = answer.len(),
            "LLM conversion complete"
        );

        Ok(Candidate {
            markdown: cleanup::run_pipeline(&strip_outer_fence(&answer), None),
            confidence: None,
            warnings,
        })
    }
}

/// Best-effort text of any supported payload.
async fn extract_text(payload: &RawPayload) -> Result<String> {
    match mime::classify(payload) {
        Format::Html => PrimaryConverter::default()
            .html_to_markdown(&String::from_utf8_lossy(&payload.bytes)),
        Format::PlainText | Format::Markdown => {
            Ok(String::from_utf8_lossy(&payload.bytes).into_owned())
        }
        Format::Pdf => office::pdf_text(payload.bytes.clone()).await,
        Format::Docx | Format::Pptx => office::SecondaryConverter
            .convert(payload)
            .await
            .map(|c| c.markdown),
        Format::Unknown => Err(PipelineError::Conversion(format!(
            "LLM converter cannot read {}",
            payload.mime_type
        ))),
    }
}

/// Models sometimes wrap the whole answer in a ```markdown fence.
fn strip_outer_fence(answer: &str) -> String {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string line (`markdown`, `md`, or empty).
    match body.split_once('\n') {
        Some((info, inner)) if !info.contains(' ') => inner.trim().to_string(),
        _ => trimmed.to_string(),
    }
}
