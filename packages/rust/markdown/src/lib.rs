//! Conversion of raw course payloads to Markdown.
//!
//! Three converters sit behind [`DocumentConverter`]:
//! - [`PrimaryConverter`]: HTML and text through `htmd` plus cleanup passes
//! - [`SecondaryConverter`]: PDF text layers, DOCX, and PPTX
//! - [`LlmConverter`]: an OpenAI-compatible chat model, opt-in
//!
//! [`ConversionChain`] tries them in order and gates each result on a
//! confidence threshold.

mod chain;
mod cleanup;
mod html;
mod llm;
pub mod mime;
mod office;

use async_trait::async_trait;

use coursepipe_shared::{ConverterKind, RawPayload, Result};

pub use chain::{
    AttemptOutcome, ChainLink, ChainOutcome, ConversionChain, Decision, LedgerEntry, decide,
};
pub use html::PrimaryConverter;
pub use llm::LlmConverter;
pub use office::SecondaryConverter;

/// Output of one converter attempt, before the chain decides on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub markdown: String,
    /// `None` when the converter does not score its output.
    pub confidence: Option<f32>,
    pub warnings: Vec<String>,
}

impl Candidate {
    pub fn is_blank(&self) -> bool {
        self.markdown.trim().is_empty()
    }
}

/// One link of the conversion chain.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Engine name recorded in the conversion ledger.
    fn name(&self) -> &'static str;

    /// Provenance recorded on the converted document.
    fn kind(&self) -> ConverterKind;

    /// Convert a payload, or fail with `PipelineError::Conversion` so the
    /// chain moves on.
    async fn convert(&self, payload: &RawPayload) -> Result<Candidate>;
}
