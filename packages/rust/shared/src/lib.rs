//! Shared types, error model, and configuration for coursepipe.
//!
//! This crate is the foundation depended on by all other coursepipe crates.
//! It provides:
//! - [`PipelineError`], the unified error type
//! - Domain types ([`Resource`], [`RawPayload`], [`ConvertedDocument`],
//!   [`FilterDecision`], [`Chunk`], [`RunState`])
//! - Configuration ([`PipelineConfig`], overrides, loading)
//! - The token estimate and content hashing used across stages

pub mod config;
pub mod digest;
pub mod error;
pub mod tokens;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    CONFIG_FILE_NAME, ChunkSection, ConfigOverrides, ConvertSection, CrawlSection, FilterSection,
    LlmSection, PipelineConfig, REGEX_PATTERN_PREFIX, RunSection, init_config, load_config_from,
    resolve_config, resolve_secret, user_config_path,
};
pub use digest::{markdown_hash, normalize_markdown, sha256_hex};
pub use error::{PipelineError, Result};
pub use tokens::count_tokens;
pub use types::{
    Chunk, ConvertedDocument, ConverterKind, CourseRef, FilterDecision, FilterReason,
    IncludeFilter, RawPayload, Resource, ResourceId, ResourceKind, RunId, RunState, RunStatus,
    Stage, StepSelection, UnitState, Visibility,
};
