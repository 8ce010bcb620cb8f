//! The ordered fallback chain.
//!
//! Each link pairs a converter with the minimum confidence its output needs.
//! Whether to stop or advance is decided by [`decide`], a pure function of
//! the attempt's result. When no link clears its gate, the best scored
//! candidate is used and flagged; when every link fails, the resource fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use coursepipe_shared::{
    ConvertedDocument, ConverterKind, PipelineConfig, PipelineError, RawPayload, ResourceId,
    Result,
};

use crate::{Candidate, DocumentConverter, LlmConverter, PrimaryConverter, SecondaryConverter};

/// What happened in one attempt, as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Ok,
    Blank,
    Failed,
}

/// Result of gating one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Use this candidate and stop.
    Accept,
    /// Try the next link. `Ok` here means a usable but low-confidence candidate.
    Next(AttemptOutcome),
}

/// Gate an attempt: errors and blank output advance, as does a scored
/// candidate below `min_confidence`. Unscored candidates pass.
pub fn decide(result: &Result<Candidate>, min_confidence: f32) -> Decision {
    match result {
        Err(_) => Decision::Next(AttemptOutcome::Failed),
        Ok(candidate) if candidate.is_blank() => Decision::Next(AttemptOutcome::Blank),
        Ok(candidate) => match candidate.confidence {
            Some(score) if score < min_confidence => Decision::Next(AttemptOutcome::Ok),
            _ => Decision::Accept,
        },
    }
}

/// One line of `ledger.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub resource_id: ResourceId,
    pub engine: String,
    pub converter: ConverterKind,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub accepted: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ChainLink {
    pub converter: Arc<dyn DocumentConverter>,
    pub min_confidence: f32,
}

impl ChainLink {
    pub fn new(converter: Arc<dyn DocumentConverter>, min_confidence: f32) -> Self {
        Self {
            converter,
            min_confidence,
        }
    }
}

/// Final result for one payload plus every attempt made.
#[derive(Debug)]
pub struct ChainOutcome {
    pub result: Result<ConvertedDocument>,
    pub attempts: Vec<LedgerEntry>,
}

pub struct ConversionChain {
    links: Vec<ChainLink>,
    /// Ceiling for a single attempt; an attempt over it counts as failed.
    attempt_timeout: Duration,
}

impl ConversionChain {
    pub fn new(links: Vec<ChainLink>, attempt_timeout: Duration) -> Self {
        Self {
            links,
            attempt_timeout,
        }
    }

    /// Primary and secondary links, plus the LLM link when enabled.
    pub fn from_config(config: &PipelineConfig, base_url: Option<Url>) -> Result<Self> {
        let mut links = vec![
            ChainLink::new(
                Arc::new(PrimaryConverter::new(base_url)),
                config.convert.primary_min_confidence,
            ),
            ChainLink::new(
                Arc::new(SecondaryConverter),
                config.convert.secondary_min_confidence,
            ),
        ];
        if config.llm_fallback_enabled {
            links.push(ChainLink::new(
                Arc::new(LlmConverter::from_config(&config.llm)?),
                0.0,
            ));
        }
        Ok(Self::new(
            links,
            Duration::from_secs(config.convert.unit_timeout_secs),
        ))
    }

    pub fn engines(&self) -> Vec<&'static str> {
        self.links.iter().map(|l| l.converter.name()).collect()
    }

    #[instrument(skip_all, fields(resource_id = %payload.resource_id, mime = %payload.mime_type))]
    pub async fn convert(&self, payload: &RawPayload) -> ChainOutcome {
        let mut attempts = Vec::with_capacity(self.links.len());
        let mut errors = Vec::new();
        // Best low-confidence candidate so far, with its converter.
        let mut fallback: Option<(Candidate, ConverterKind, usize)> = None;

        for link in &self.links {
            let converter = link.converter.as_ref();
            let started = Instant::now();
            let result = match tokio::time::timeout(self.attempt_timeout, converter.convert(payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Conversion(format!(
                    "{} timed out after {}s",
                    converter.name(),
                    self.attempt_timeout.as_secs()
                ))),
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let decision = decide(&result, link.min_confidence);

            let mut entry = LedgerEntry {
                resource_id: payload.resource_id.clone(),
                engine: converter.name().to_string(),
                converter: converter.kind(),
                outcome: AttemptOutcome::Ok,
                confidence: result.as_ref().ok().and_then(|c| c.confidence),
                accepted: false,
                duration_ms,
                error: None,
            };

            match (decision, result) {
                (Decision::Accept, Ok(candidate)) => {
                    entry.accepted = true;
                    attempts.push(entry);
                    debug!(converter = %converter.kind(), "conversion accepted");
                    return ChainOutcome {
                        result: Ok(document(payload, converter.kind(), candidate)),
                        attempts,
                    };
                }
                (Decision::Next(outcome), Err(e)) => {
                    entry.outcome = outcome;
                    entry.error = Some(e.to_string());
                    debug!(converter = %converter.kind(), error = %e, "conversion attempt failed");
                    errors.push(format!("{}: {e}", converter.name()));
                }
                (Decision::Next(AttemptOutcome::Ok), Ok(candidate)) => {
                    debug!(
                        converter = %converter.kind(),
                        confidence = ?candidate.confidence,
                        threshold = link.min_confidence,
                        "below confidence threshold"
                    );
                    let better = fallback.as_ref().is_none_or(|(best, _, _)| {
                        candidate.confidence.unwrap_or(0.0) > best.confidence.unwrap_or(0.0)
                    });
                    if better {
                        fallback = Some((candidate, converter.kind(), attempts.len()));
                    }
                }
                (Decision::Next(outcome), Ok(_)) => {
                    entry.outcome = outcome;
                    errors.push(format!("{}: blank output", converter.name()));
                }
                (Decision::Accept, Err(e)) => {
                    // `decide` never accepts an error.
                    entry.outcome = AttemptOutcome::Failed;
                    entry.error = Some(e.to_string());
                    errors.push(format!("{}: {e}", converter.name()));
                }
            }
            attempts.push(entry);
        }

        if let Some((mut candidate, kind, index)) = fallback {
            if let Some(entry) = attempts.get_mut(index) {
                entry.accepted = true;
            }
            candidate
                .warnings
                .push("no converter met its confidence threshold; using best candidate".into());
            info!(converter = %kind, "accepting low-confidence conversion");
            return ChainOutcome {
                result: Ok(document(payload, kind, candidate)),
                attempts,
            };
        }

        warn!(attempts = attempts.len(), "every converter failed");
        ChainOutcome {
            result: Err(PipelineError::Conversion(errors.join("; "))),
            attempts,
        }
    }
}

fn document(payload: &RawPayload, kind: ConverterKind, candidate: Candidate) -> ConvertedDocument {
    ConvertedDocument {
        resource_id: payload.resource_id.clone(),
        markdown: candidate.markdown,
        converter_used: kind,
        conversion_confidence: candidate.confidence,
        warnings: candidate.warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted converter that logs its calls.
    struct Scripted {
        name: &'static str,
        kind: ConverterKind,
        reply: std::result::Result<(&'static str, Option<f32>), &'static str>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl DocumentConverter for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn kind(&self) -> ConverterKind {
            self.kind
        }

        async fn convert(&self, _payload: &RawPayload) -> Result<Candidate> {
            self.calls.lock().unwrap().push(self.name);
            match self.reply {
                Ok((markdown, confidence)) => Ok(Candidate {
                    markdown: markdown.to_string(),
                    confidence,
                    warnings: Vec::new(),
                }),
                Err(message) => Err(PipelineError::Conversion(message.to_string())),
            }
        }
    }

    type Reply = std::result::Result<(&'static str, Option<f32>), &'static str>;

    fn chain(replies: [Reply; 3]) -> (ConversionChain, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let names = [
            ("primary", ConverterKind::Primary),
            ("secondary", ConverterKind::Fallback),
            ("llm", ConverterKind::Llm),
        ];
        let links = names
            .into_iter()
            .zip(replies)
            .map(|((name, kind), reply)| {
                ChainLink::new(
                    Arc::new(Scripted {
                        name,
                        kind,
                        reply,
                        calls: Arc::clone(&calls),
                    }),
                    0.5,
                )
            })
            .collect();
        (ConversionChain::new(links, Duration::from_secs(5)), calls)
    }

    fn payload() -> RawPayload {
        RawPayload::new(ResourceId::from("file-1"), "application/pdf", vec![1, 2, 3])
    }

    #[test]
    fn decide_is_a_pure_gate() {
        let ok = |c: Option<f32>| -> Result<Candidate> {
            Ok(Candidate {
                markdown: "text".into(),
                confidence: c,
                warnings: Vec::new(),
            })
        };
        assert_eq!(decide(&ok(Some(0.9)), 0.5), Decision::Accept);
        assert_eq!(decide(&ok(None), 0.5), Decision::Accept);
        assert_eq!(decide(&ok(Some(0.2)), 0.5), Decision::Next(AttemptOutcome::Ok));
        let blank: Result<Candidate> = Ok(Candidate {
            markdown: "  \n".into(),
            confidence: Some(1.0),
            warnings: Vec::new(),
        });
        assert_eq!(decide(&blank, 0.5), Decision::Next(AttemptOutcome::Blank));
        let failed: Result<Candidate> = Err(PipelineError::Conversion("x".into()));
        assert_eq!(decide(&failed, 0.5), Decision::Next(AttemptOutcome::Failed));
    }

    #[tokio::test]
    async fn primary_success_short_circuits() {
        let (chain, calls) = chain([
            Ok(("# Page", Some(1.0))),
            Ok(("unused", Some(1.0))),
            Ok(("unused", None)),
        ]);
        let outcome = chain.convert(&payload()).await;
        let doc = outcome.result.unwrap();
        assert_eq!(doc.converter_used, ConverterKind::Primary);
        assert_eq!(*calls.lock().unwrap(), vec!["primary"]);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn primary_failure_falls_to_secondary() {
        let (chain, calls) = chain([
            Err("unsupported"),
            Ok(("pdf text", Some(0.9))),
            Ok(("unused", None)),
        ]);
        let outcome = chain.convert(&payload()).await;
        assert_eq!(outcome.result.unwrap().converter_used, ConverterKind::Fallback);
        assert_eq!(*calls.lock().unwrap(), vec!["primary", "secondary"]);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Failed);
        assert!(outcome.attempts[1].accepted);
    }

    #[tokio::test]
    async fn llm_only_after_both_gates_fail() {
        let (chain, calls) = chain([
            Ok(("", Some(1.0))),
            Ok(("noisy", Some(0.2))),
            Ok(("# Clean", None)),
        ]);
        let outcome = chain.convert(&payload()).await;
        let doc = outcome.result.unwrap();
        assert_eq!(doc.converter_used, ConverterKind::Llm);
        assert_eq!(doc.markdown, "# Clean");
        assert_eq!(*calls.lock().unwrap(), vec!["primary", "secondary", "llm"]);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Blank);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Ok);
        assert!(!outcome.attempts[1].accepted);
    }

    #[tokio::test]
    async fn best_low_confidence_candidate_used_when_llm_fails() {
        let (chain, _) = chain([
            Ok(("thin", Some(0.3))),
            Ok(("noisy", Some(0.2))),
            Err("llm down"),
        ]);
        let outcome = chain.convert(&payload()).await;
        let doc = outcome.result.unwrap();
        assert_eq!(doc.converter_used, ConverterKind::Primary);
        assert_eq!(doc.markdown, "thin");
        assert_eq!(doc.warnings.len(), 1);
        assert!(outcome.attempts[0].accepted);
    }

    #[tokio::test]
    async fn all_failures_fail_the_resource() {
        let (chain, _) = chain([Err("a"), Err("b"), Ok(("   ", None))]);
        let outcome = chain.convert(&payload()).await;
        assert!(matches!(outcome.result, Err(PipelineError::Conversion(_))));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::Blank);
    }
}
