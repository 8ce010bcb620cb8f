//! Core domain types for course runs: resources, payloads, converted
//! documents, filter decisions, chunks, and the persisted run state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// CourseRef
// ---------------------------------------------------------------------------

/// A parsed course locator: the LMS origin plus the numeric course id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRef {
    /// Origin of the LMS instance (`https://canvas.example.edu/`).
    pub base: Url,
    /// Course identifier as it appears in `/courses/<id>`.
    pub course_id: String,
}

impl CourseRef {
    /// Parse a course URL such as `https://canvas.example.edu/courses/12345/modules`.
    pub fn parse(course_url: &str) -> Result<Self> {
        let url = Url::parse(course_url)
            .map_err(|e| PipelineError::config(format!("invalid course_url '{course_url}': {e}")))?;

        let mut segments = url
            .path_segments()
            .ok_or_else(|| PipelineError::config(format!("course_url '{course_url}' has no path")))?;

        let course_id = loop {
            match segments.next() {
                Some("courses") => match segments.next() {
                    Some(id) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
                        break id.to_string();
                    }
                    _ => {
                        return Err(PipelineError::config(format!(
                            "course_url '{course_url}' has no numeric course id after /courses/"
                        )));
                    }
                },
                Some(_) => continue,
                None => {
                    return Err(PipelineError::config(format!(
                        "course_url '{course_url}' must contain /courses/<id>"
                    )));
                }
            }
        };

        let mut base = url.clone();
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self { base, course_id })
    }
}

// ---------------------------------------------------------------------------
// ResourceKind / ResourceId
// ---------------------------------------------------------------------------

/// Kind of a crawlable course item. Determines the crawler handler and the
/// converter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Syllabus,
    Module,
    ModuleItem,
    Page,
    File,
    Assignment,
    Quiz,
    Discussion,
    Announcement,
}

impl ResourceKind {
    /// Every kind, in the order the crawler lists them.
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Syllabus,
        ResourceKind::Module,
        ResourceKind::ModuleItem,
        ResourceKind::Page,
        ResourceKind::Assignment,
        ResourceKind::Quiz,
        ResourceKind::Discussion,
        ResourceKind::Announcement,
        ResourceKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syllabus => "syllabus",
            Self::Module => "module",
            Self::ModuleItem => "module-item",
            Self::Page => "page",
            Self::File => "file",
            Self::Assignment => "assignment",
            Self::Quiz => "quiz",
            Self::Discussion => "discussion",
            Self::Announcement => "announcement",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        let trimmed = match normalized.as_str() {
            "quizzes" => "quiz",
            other => other.strip_suffix('s').unwrap_or(other),
        };
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized || k.as_str() == trimmed)
            .ok_or_else(|| PipelineError::config(format!("unknown resource kind '{s}'")))
    }
}

/// Stable identifier of a resource within one course: `<kind>-<native id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(kind: ResourceKind, native_id: impl std::fmt::Display) -> Self {
        Self(format!("{}-{native_id}", kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// Whether students can see an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    StudentVisible,
    InstructorOnly,
}

/// One crawlable unit of a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub title: String,
    /// Containing module (or module item) if the resource was reached through one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,
    pub visibility: Visibility,
    /// Opaque locator the crawler uses to re-fetch the payload.
    pub source_ref: String,
    /// SHA-256 of the raw payload, set once fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// IncludeFilter
// ---------------------------------------------------------------------------

/// Scope of a crawl.
///
/// Text form: `course_root` (or `all`), a comma-separated kind list such as
/// `pages,files`, or `module:<id>` for one module subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IncludeFilter {
    All,
    Kinds(Vec<ResourceKind>),
    Module(String),
}

impl IncludeFilter {
    /// Whether resources of `kind` should be listed at all.
    pub fn admits_kind(&self, kind: ResourceKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
            // A module subtree reaches every kind through module items.
            Self::Module(_) => true,
        }
    }
}

impl std::str::FromStr for IncludeFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("course_root") || s.eq_ignore_ascii_case("all")
        {
            return Ok(Self::All);
        }
        if let Some(id) = s.strip_prefix("module:") {
            let id = id.trim();
            if id.is_empty() {
                return Err(PipelineError::config("include 'module:' requires a module id"));
            }
            return Ok(Self::Module(id.to_string()));
        }
        let kinds = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ResourceKind>>>()?;
        Ok(Self::Kinds(kinds))
    }
}

impl TryFrom<String> for IncludeFilter {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<IncludeFilter> for String {
    fn from(value: IncludeFilter) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for IncludeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("course_root"),
            Self::Kinds(kinds) => {
                let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                f.write_str(&names.join(","))
            }
            Self::Module(id) => write!(f, "module:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// RawPayload
// ---------------------------------------------------------------------------

/// Bytes fetched for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub resource_id: ResourceId,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

impl RawPayload {
    pub fn new(resource_id: ResourceId, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let content_hash = crate::digest::sha256_hex(&bytes);
        Self {
            resource_id,
            mime_type: mime_type.into(),
            bytes,
            content_hash,
        }
    }
}

// ---------------------------------------------------------------------------
// ConvertedDocument
// ---------------------------------------------------------------------------

/// Which link of the fallback chain produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    Primary,
    Fallback,
    Llm,
}

impl ConverterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Llm => "llm",
        }
    }
}

impl std::fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Markdown produced from one raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub resource_id: ResourceId,
    pub markdown: String,
    pub converter_used: ConverterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_confidence: Option<f32>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// FilterDecision
// ---------------------------------------------------------------------------

/// Why a document was dropped (or `None` when kept).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "of")]
pub enum FilterReason {
    None,
    /// Listed in `filter.exclude_resource_ids`.
    Excluded,
    BlacklistedTitle,
    BelowTokenThreshold,
    DuplicateOf(ResourceId),
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Excluded => "excluded",
            Self::BlacklistedTitle => "blacklisted-title",
            Self::BelowTokenThreshold => "below-token-threshold",
            Self::DuplicateOf(_) => "duplicate-of",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub resource_id: ResourceId,
    pub kept: bool,
    pub reason: FilterReason,
    /// Blacklist pattern that matched the title, as configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
}

impl FilterDecision {
    pub fn keep(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            kept: true,
            reason: FilterReason::None,
            matched_pattern: None,
        }
    }

    pub fn drop(resource_id: ResourceId, reason: FilterReason) -> Self {
        Self {
            resource_id,
            kept: false,
            reason,
            matched_pattern: None,
        }
    }

    pub fn blacklisted(resource_id: ResourceId, pattern: impl Into<String>) -> Self {
        Self {
            matched_pattern: Some(pattern.into()),
            ..Self::drop(resource_id, FilterReason::BlacklistedTitle)
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A bounded slice of a kept document's Markdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub resource_id: ResourceId,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    /// Byte offset of `text` within the source Markdown.
    pub start_offset: usize,
    /// Leading bytes of `text` repeated from the previous chunk.
    pub overlap_len: usize,
}

// ---------------------------------------------------------------------------
// Stages and unit states
// ---------------------------------------------------------------------------

/// The four pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Crawl,
    Convert,
    Filter,
    Chunk,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Crawl, Stage::Convert, Stage::Filter, Stage::Chunk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Convert => "convert",
            Self::Filter => "filter",
            Self::Chunk => "chunk",
        }
    }

    /// The stage whose output this stage reads.
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Crawl => None,
            Self::Convert => Some(Self::Crawl),
            Self::Filter => Some(Self::Convert),
            Self::Chunk => Some(Self::Filter),
        }
    }

    /// Run status while this stage executes.
    pub fn running_status(&self) -> RunStatus {
        match self {
            Self::Crawl => RunStatus::Crawling,
            Self::Convert => RunStatus::Converting,
            Self::Filter => RunStatus::Filtering,
            Self::Chunk => RunStatus::Chunking,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crawl" => Ok(Self::Crawl),
            "convert" => Ok(Self::Convert),
            "filter" => Ok(Self::Filter),
            "chunk" => Ok(Self::Chunk),
            other => Err(PipelineError::config(format!("unknown step '{other}'"))),
        }
    }
}

/// Which stages an invocation should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepSelection {
    All,
    Only(Vec<Stage>),
}

impl StepSelection {
    /// Selected stages in canonical order, deduplicated.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            Self::All => Stage::ALL.to_vec(),
            Self::Only(stages) => Stage::ALL
                .iter()
                .copied()
                .filter(|s| stages.contains(s))
                .collect(),
        }
    }
}

impl std::str::FromStr for StepSelection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let stages = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Stage>>>()?;
        if stages.is_empty() {
            return Err(PipelineError::config("steps must name at least one stage"));
        }
        if Stage::ALL.iter().all(|s| stages.contains(s)) {
            return Ok(Self::All);
        }
        Ok(Self::Only(stages))
    }
}

impl TryFrom<String> for StepSelection {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StepSelection> for String {
    fn from(value: StepSelection) -> Self {
        match value {
            StepSelection::All => "all".into(),
            other => other
                .stages()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Per-resource, per-stage state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Fetching,
    Fetched,
    Failed,
    Converting,
    Converted,
    ConversionFailed,
    Kept,
    FilteredOut,
    Chunked,
    ChunkFailed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Fetched
                | Self::Failed
                | Self::Converted
                | Self::ConversionFailed
                | Self::Kept
                | Self::FilteredOut
                | Self::Chunked
                | Self::ChunkFailed
        )
    }

    /// Terminal success: the resource proceeds to the next stage.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Fetched | Self::Converted | Self::Kept | Self::Chunked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
            Self::Converting => "converting",
            Self::Converted => "converted",
            Self::ConversionFailed => "conversion_failed",
            Self::Kept => "kept",
            Self::FilteredOut => "filtered_out",
            Self::Chunked => "chunked",
            Self::ChunkFailed => "chunk_failed",
        }
    }
}

impl std::str::FromStr for UnitState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let all = [
            Self::Pending,
            Self::Fetching,
            Self::Fetched,
            Self::Failed,
            Self::Converting,
            Self::Converted,
            Self::ConversionFailed,
            Self::Kept,
            Self::FilteredOut,
            Self::Chunked,
            Self::ChunkFailed,
        ];
        all.into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| PipelineError::RunStateCorrupt(format!("unknown unit state '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// RunId / RunStatus / RunState
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of one run.
///
/// `Suspended` marks a run where every requested step finished cleanly but
/// later stages were not requested in this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Crawling,
    Converting,
    Filtering,
    Chunking,
    Completed,
    Partial,
    Suspended,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Crawling => "crawling",
            Self::Converting => "converting",
            Self::Filtering => "filtering",
            Self::Chunking => "chunking",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "crawling" => Ok(Self::Crawling),
            "converting" => Ok(Self::Converting),
            "filtering" => Ok(Self::Filtering),
            "chunking" => Ok(Self::Chunking),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "suspended" => Ok(Self::Suspended),
            other => Err(PipelineError::RunStateCorrupt(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// In-memory view of a run's persisted progress.
///
/// Loaded from the run directory on start or resume; every mutation goes
/// through the storage layer first and is mirrored here afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: RunId,
    pub course_url: String,
    pub status: RunStatus,
    /// Last stage whose resource set fully resolved.
    pub stage_cursor: Option<Stage>,
    pub created_at: DateTime<Utc>,
    /// Whether the crawl finished enumerating the course.
    pub listing_complete: bool,
    /// Resources in crawl-discovery order.
    pub resources: Vec<Resource>,
    /// Latest state of every unit that has been touched, per stage.
    pub units: HashMap<Stage, BTreeMap<ResourceId, UnitState>>,
}

impl RunState {
    pub fn new(run_id: RunId, course_url: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            course_url: course_url.into(),
            status: RunStatus::Created,
            stage_cursor: None,
            created_at,
            listing_complete: false,
            resources: Vec::new(),
            units: HashMap::new(),
        }
    }

    /// State of a resource in a stage (`Pending` when never touched).
    pub fn unit_state(&self, stage: Stage, id: &ResourceId) -> UnitState {
        self.units
            .get(&stage)
            .and_then(|m| m.get(id))
            .copied()
            .unwrap_or(UnitState::Pending)
    }

    pub fn set_unit_state(&mut self, stage: Stage, id: ResourceId, state: UnitState) {
        self.units.entry(stage).or_default().insert(id, state);
    }

    /// Resources whose unit in `stage` reached a terminal state.
    pub fn completed_resource_ids(&self, stage: Stage) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter(|r| self.unit_state(stage, &r.id).is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Resources that reached terminal success in `stage`, in crawl order.
    pub fn succeeded_in(&self, stage: Stage) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| self.unit_state(stage, &r.id).is_success())
            .collect()
    }

    /// Resources that enter `stage`: every crawled resource for the crawl,
    /// otherwise those that succeeded in the previous stage.
    pub fn inputs_for(&self, stage: Stage) -> Vec<&Resource> {
        match stage.previous() {
            None => self.resources.iter().collect(),
            Some(prev) => self.succeeded_in(prev),
        }
    }

    /// Whether every input of `stage` is terminal.
    pub fn stage_resolved(&self, stage: Stage) -> bool {
        if stage == Stage::Crawl && !self.listing_complete {
            return false;
        }
        self.inputs_for(stage)
            .iter()
            .all(|r| self.unit_state(stage, &r.id).is_terminal())
    }

    /// Number of units in `stage` currently in `state`.
    pub fn count(&self, stage: Stage, state: UnitState) -> usize {
        self.resources
            .iter()
            .filter(|r| self.unit_state(stage, &r.id) == state)
            .count()
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| &r.id == id)
    }
}
