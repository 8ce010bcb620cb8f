//! Rule-based selection of converted documents for chunking.
//!
//! Rules run in a fixed order and the first match decides:
//! 1. explicit exclusion by resource id (`excluded`)
//! 2. title blacklist, substring or `re:` regex, case-insensitive
//! 3. token count below `min_tokens`
//! 4. normalized-content duplicate of an already kept document
//!
//! Only rule 4 depends on other documents, through [`CorpusContext`]. Callers
//! must evaluate in crawl-discovery order so the earliest copy is kept.

use std::collections::{HashMap, HashSet};

use regex::{Regex, RegexBuilder};
use tracing::debug;

use coursepipe_shared::{
    ConvertedDocument, FilterDecision, FilterReason, PipelineConfig, PipelineError,
    REGEX_PATTERN_PREFIX, ResourceId, Result, count_tokens, markdown_hash,
};

/// A compiled blacklist entry.
#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased needle.
    Substring(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct TitlePattern {
    /// The pattern as written in the config, reported on a match.
    source: String,
    matcher: Matcher,
}

impl TitlePattern {
    fn parse(pattern: &str) -> Result<Self> {
        let matcher = match pattern.strip_prefix(REGEX_PATTERN_PREFIX) {
            Some(expr) => RegexBuilder::new(expr)
                .case_insensitive(true)
                .build()
                .map(Matcher::Regex)
                .map_err(|e| {
                    PipelineError::config(format!("invalid blacklist pattern '{pattern}': {e}"))
                })?,
            None => Matcher::Substring(pattern.to_lowercase()),
        };
        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    fn matches(&self, title: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(needle) => title.to_lowercase().contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(title),
        }
    }
}

/// Running state shared across one pass over the corpus.
#[derive(Debug, Default, Clone)]
pub struct CorpusContext {
    /// Normalized content hash to the first kept resource with that content.
    kept_by_hash: HashMap<String, ResourceId>,
}

impl CorpusContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from documents already kept in an earlier invocation.
    pub fn from_kept<'a>(kept: impl IntoIterator<Item = &'a ConvertedDocument>) -> Self {
        let mut ctx = Self::new();
        for doc in kept {
            ctx.record_kept(doc);
        }
        ctx
    }

    fn record_kept(&mut self, doc: &ConvertedDocument) {
        self.kept_by_hash
            .entry(markdown_hash(&doc.markdown))
            .or_insert_with(|| doc.resource_id.clone());
    }

    fn duplicate_of(&self, doc: &ConvertedDocument) -> Option<&ResourceId> {
        self.kept_by_hash
            .get(&markdown_hash(&doc.markdown))
            .filter(|id| **id != doc.resource_id)
    }

    pub fn kept_count(&self) -> usize {
        self.kept_by_hash.len()
    }
}

/// Compiled filter rules.
#[derive(Debug, Clone)]
pub struct Filter {
    excluded: HashSet<ResourceId>,
    blacklist: Vec<TitlePattern>,
    min_tokens: usize,
    dedupe: bool,
}

impl Filter {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let blacklist = config
            .blacklist_patterns
            .iter()
            .map(|p| TitlePattern::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            excluded: config
                .filter
                .exclude_resource_ids
                .iter()
                .map(|id| ResourceId::from(id.as_str()))
                .collect(),
            blacklist,
            min_tokens: config.min_tokens,
            dedupe: config.filter.dedupe,
        })
    }

    /// Decide whether `document` (titled `title`) proceeds to chunking.
    /// Kept documents are recorded in `ctx`.
    pub fn evaluate(
        &self,
        title: &str,
        document: &ConvertedDocument,
        ctx: &mut CorpusContext,
    ) -> FilterDecision {
        let id = document.resource_id.clone();

        if self.excluded.contains(&id) {
            return FilterDecision::drop(id, FilterReason::Excluded);
        }
        if let Some(pattern) = self.blacklist.iter().find(|p| p.matches(title)) {
            debug!(resource_id = %id, title, pattern = %pattern.source, "title blacklisted");
            return FilterDecision::blacklisted(id, pattern.source.clone());
        }
        let tokens = count_tokens(&document.markdown);
        if tokens < self.min_tokens {
            debug!(resource_id = %id, tokens, min = self.min_tokens, "below token threshold");
            return FilterDecision::drop(id, FilterReason::BelowTokenThreshold);
        }
        if self.dedupe {
            if let Some(first) = ctx.duplicate_of(document) {
                return FilterDecision::drop(id, FilterReason::DuplicateOf(first.clone()));
            }
        }

        ctx.record_kept(document);
        FilterDecision::keep(id)
    }
}
