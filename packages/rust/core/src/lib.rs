//! Run orchestration for coursepipe.
//!
//! This crate sequences the crawl, convert, filter, and chunk stages over one
//! course, persisting every unit of work so an interrupted run can resume
//! from its run directory alone.

pub mod manifest;
pub mod pipeline;
pub mod progress;
mod stages;

pub use manifest::{
    ChunkSummary, Interruption, ManifestBody, ManifestCounts, ManifestResource, RunHeader,
    RunManifest,
};
pub use pipeline::{RunOptions, RunOutcome, inspect, resolve_run_dir, run};
pub use progress::{ProgressReporter, SilentProgress};
