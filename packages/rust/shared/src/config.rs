//! Pipeline configuration for coursepipe.
//!
//! A run is configured either from a TOML file (`coursepipe.toml`) or from
//! CLI flags. Flags override file values, which override defaults; both
//! paths produce the same [`PipelineConfig`].

use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::{CourseRef, IncludeFilter, StepSelection};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "coursepipe.toml";

/// Directory under the home directory holding the per-user config.
pub const USER_CONFIG_DIR_NAME: &str = ".coursepipe";

/// Prefix marking a blacklist entry as a regular expression.
pub const REGEX_PATTERN_PREFIX: &str = "re:";

// ---------------------------------------------------------------------------
// Config structs (matching coursepipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level pipeline config, deserialized from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Course to ingest, e.g. `https://canvas.example.edu/courses/12345`.
    #[serde(default)]
    pub course_url: String,

    /// Crawl scope.
    #[serde(default = "default_include")]
    pub include: IncludeFilter,

    /// Stages to run in this invocation.
    #[serde(default = "default_steps")]
    pub steps: StepSelection,

    /// Whether the LLM-assisted converter may be used as the last link.
    #[serde(default)]
    pub llm_fallback_enabled: bool,

    /// Title patterns that drop a document. Plain entries match as
    /// case-insensitive substrings, `re:` entries as case-insensitive regexes.
    #[serde(default = "default_blacklist_patterns")]
    pub blacklist_patterns: Vec<String>,

    /// Documents with fewer tokens are dropped.
    #[serde(default)]
    pub min_tokens: usize,

    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,

    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,

    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub crawl: CrawlSection,

    #[serde(default)]
    pub convert: ConvertSection,

    #[serde(default)]
    pub llm: LlmSection,

    #[serde(default)]
    pub filter: FilterSection,

    #[serde(default)]
    pub chunk: ChunkSection,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            course_url: String::new(),
            include: default_include(),
            steps: default_steps(),
            llm_fallback_enabled: false,
            blacklist_patterns: default_blacklist_patterns(),
            min_tokens: 0,
            max_chunk_tokens: default_max_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            run: RunSection::default(),
            crawl: CrawlSection::default(),
            convert: ConvertSection::default(),
            llm: LlmSection::default(),
            filter: FilterSection::default(),
            chunk: ChunkSection::default(),
        }
    }
}

fn default_include() -> IncludeFilter {
    IncludeFilter::All
}
fn default_steps() -> StepSelection {
    StepSelection::All
}
fn default_blacklist_patterns() -> Vec<String> {
    [
        "midterm", "exam", "solution", "sol", "explanation", "key", "answers", "check-in",
        "checkin", "check in",
    ]
    .iter()
    .map(|term| format!(r"{REGEX_PATTERN_PREFIX}\b{}\b", regex::escape(term)))
    .collect()
}
fn default_max_chunk_tokens() -> usize {
    400
}
fn default_overlap_tokens() -> usize {
    50
}

/// `[run]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    /// Directory holding one subdirectory per run.
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,

    /// Run directory name. Defaults to `course-<course id>`, so re-invoking
    /// with `--resume` finds the same directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            runs_root: default_runs_root(),
            run_name: None,
        }
    }
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("runs")
}

/// `[crawl]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Concurrent fetch workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries after the first attempt for retryable failures.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,

    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Ceiling for a single backoff delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Timeout for one fetch attempt.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    /// Pause before every API request.
    #[serde(default)]
    pub rate_limit_ms: u64,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            workers: default_workers(),
            retry_budget: default_retry_budget(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            unit_timeout_secs: default_unit_timeout_secs(),
            rate_limit_ms: 0,
        }
    }
}

fn default_token_env() -> String {
    "CANVAS_TOKEN".into()
}
fn default_workers() -> usize {
    4
}
fn default_retry_budget() -> usize {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_unit_timeout_secs() -> u64 {
    60
}

/// `[convert]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertSection {
    /// Concurrent conversion workers.
    #[serde(default = "default_convert_workers")]
    pub workers: usize,

    /// Minimum confidence for the primary converter's result to be accepted.
    #[serde(default = "default_min_confidence")]
    pub primary_min_confidence: f32,

    /// Minimum confidence for the secondary converter's result to be accepted.
    #[serde(default = "default_min_confidence")]
    pub secondary_min_confidence: f32,

    /// Timeout for one conversion attempt.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
}

impl Default for ConvertSection {
    fn default() -> Self {
        Self {
            workers: default_convert_workers(),
            primary_min_confidence: default_min_confidence(),
            secondary_min_confidence: default_min_confidence(),
            unit_timeout_secs: default_unit_timeout_secs(),
        }
    }
}

fn default_convert_workers() -> usize {
    2
}
fn default_min_confidence() -> f32 {
    0.5
}

/// `[llm]` section (OpenAI-compatible chat completions endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSection {
    /// Name of the env var holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    /// Source text beyond this many characters is truncated before prompting.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            endpoint: default_endpoint(),
            timeout_secs: default_llm_timeout_secs(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o".into()
}
fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".into()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_input_chars() -> usize {
    60_000
}

/// `[filter]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSection {
    /// Drop documents whose normalized content was already kept.
    #[serde(default = "default_true")]
    pub dedupe: bool,

    /// Resource ids that are always dropped.
    #[serde(default)]
    pub exclude_resource_ids: Vec<String>,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            dedupe: true,
            exclude_resource_ids: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[chunk]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSection {
    /// Prefix every per-chunk Markdown file with YAML frontmatter.
    #[serde(default = "default_true")]
    pub frontmatter: bool,

    /// Write one Markdown file per chunk under `chunks/`.
    #[serde(default = "default_true")]
    pub write_files: bool,
}

impl Default for ChunkSection {
    fn default() -> Self {
        Self {
            frontmatter: true,
            write_files: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Overrides (CLI flags)
// ---------------------------------------------------------------------------

/// Values supplied as flags. `None` leaves the file/default value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub course_url: Option<String>,
    pub include: Option<IncludeFilter>,
    pub steps: Option<StepSelection>,
    pub llm_fallback_enabled: Option<bool>,
    pub blacklist_patterns: Option<Vec<String>>,
    pub min_tokens: Option<usize>,
    pub max_chunk_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
    pub runs_root: Option<PathBuf>,
    pub run_name: Option<String>,
    pub workers: Option<usize>,
    pub retry_budget: Option<usize>,
    pub dedupe: Option<bool>,
}

impl ConfigOverrides {
    /// Apply every set flag on top of `config`.
    pub fn apply(self, config: &mut PipelineConfig) {
        if let Some(v) = self.course_url {
            config.course_url = v;
        }
        if let Some(v) = self.include {
            config.include = v;
        }
        if let Some(v) = self.steps {
            config.steps = v;
        }
        if let Some(v) = self.llm_fallback_enabled {
            config.llm_fallback_enabled = v;
        }
        if let Some(v) = self.blacklist_patterns {
            config.blacklist_patterns = v;
        }
        if let Some(v) = self.min_tokens {
            config.min_tokens = v;
        }
        if let Some(v) = self.max_chunk_tokens {
            config.max_chunk_tokens = v;
        }
        if let Some(v) = self.overlap_tokens {
            config.overlap_tokens = v;
        }
        if let Some(v) = self.runs_root {
            config.run.runs_root = v;
        }
        if let Some(v) = self.run_name {
            config.run.run_name = Some(v);
        }
        if let Some(v) = self.workers {
            config.crawl.workers = v;
        }
        if let Some(v) = self.retry_budget {
            config.crawl.retry_budget = v;
        }
        if let Some(v) = self.dedupe {
            config.filter.dedupe = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl PipelineConfig {
    /// Check the config for errors that must abort before any run state exists.
    pub fn validate(&self) -> Result<()> {
        CourseRef::parse(&self.course_url)?;

        if self.max_chunk_tokens == 0 {
            return Err(PipelineError::config("max_chunk_tokens must be greater than 0"));
        }
        if self.overlap_tokens >= self.max_chunk_tokens {
            return Err(PipelineError::config(format!(
                "overlap_tokens ({}) must be smaller than max_chunk_tokens ({})",
                self.overlap_tokens, self.max_chunk_tokens
            )));
        }
        if self.crawl.workers == 0 || self.convert.workers == 0 {
            return Err(PipelineError::config("worker counts must be at least 1"));
        }
        for range in [
            ("convert.primary_min_confidence", self.convert.primary_min_confidence),
            ("convert.secondary_min_confidence", self.convert.secondary_min_confidence),
        ] {
            if !(0.0..=1.0).contains(&range.1) {
                return Err(PipelineError::config(format!(
                    "{} must be within 0.0..=1.0",
                    range.0
                )));
            }
        }
        for pattern in &self.blacklist_patterns {
            let body = pattern.strip_prefix(REGEX_PATTERN_PREFIX).unwrap_or(pattern);
            if body.trim().is_empty() {
                return Err(PipelineError::config(
                    "blacklist patterns must not be empty; use an empty list to disable the blacklist",
                ));
            }
            if let Some(expr) = pattern.strip_prefix(REGEX_PATTERN_PREFIX) {
                RegexBuilder::new(expr)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        PipelineError::config(format!("invalid blacklist pattern '{pattern}': {e}"))
                    })?;
            }
        }
        Ok(())
    }

    /// Serialize to the TOML format accepted by [`load_config_from`].
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::config(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load the pipeline config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Per-user config file (`~/.coursepipe/coursepipe.toml`), if a home
/// directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Resolve the effective config: defaults, then a file, then flags.
///
/// Without an explicit `file`, `./coursepipe.toml` is used if present,
/// then the per-user file.
pub fn resolve_config(file: Option<&Path>, overrides: ConfigOverrides) -> Result<PipelineConfig> {
    let discovered = || {
        std::iter::once(PathBuf::from(CONFIG_FILE_NAME))
            .chain(user_config_path())
            .find(|p| p.exists())
    };
    let mut config = match file {
        Some(path) => load_config_from(path)?,
        None => match discovered() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "using discovered config file");
                load_config_from(&path)?
            }
            None => PipelineConfig::default(),
        },
    };
    overrides.apply(&mut config);
    Ok(config)
}

/// Write a default config file at `path`. Refuses to overwrite.
pub fn init_config(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Err(PipelineError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }

    let config = PipelineConfig {
        course_url: "https://canvas.example.edu/courses/12345".into(),
        ..PipelineConfig::default()
    };
    std::fs::write(path, config.to_toml()?).map_err(|e| PipelineError::io(path, e))?;
    tracing::info!(path = %path.display(), "created default config file");

    Ok(path.to_path_buf())
}

/// Read a secret from the env var named `var_name`.
pub fn resolve_secret(var_name: &str, purpose: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(PipelineError::config(format!(
            "{purpose} not found. Set the {var_name} environment variable."
        ))),
    }
}
