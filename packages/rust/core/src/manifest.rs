//! The run manifest written to `manifest.json` at the end of every invocation.
//!
//! Identity and timing live in [`RunHeader`]; everything else is in
//! [`ManifestBody`], which is a pure function of the run directory's content.
//! An interrupted run that is later resumed therefore ends with the same body
//! as an uninterrupted one.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coursepipe_shared::{
    ConverterKind, FilterDecision, FilterReason, ResourceId, ResourceKind, Result, RunId,
    RunState, RunStatus, Stage, UnitState,
};
use coursepipe_storage::{RunLayout, UnitFailure, read_jsonl};

use crate::stages::tree_path;

/// Process exit code for a run that ended `partial`.
pub const PARTIAL_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run: RunHeader,
    #[serde(flatten)]
    pub body: ManifestBody,
}

impl RunManifest {
    /// `0` for `completed`/`suspended`, [`PARTIAL_EXIT_CODE`] for `partial`.
    pub fn exit_code(&self) -> i32 {
        match self.body.status {
            RunStatus::Partial => PARTIAL_EXIT_CODE,
            _ => 0,
        }
    }
}

/// Run identity and timing of the invocation that wrote the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time of the last invocation.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestBody {
    pub course_url: String,
    pub status: RunStatus,
    pub stage_cursor: Option<Stage>,
    pub counts: ManifestCounts,
    /// Where and why the last invocation stopped early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption: Option<Interruption>,
    /// Every selected resource, in crawl order.
    pub resources: Vec<ManifestResource>,
    /// Units whose latest state is a failure.
    pub errors: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCounts {
    pub fetched: usize,
    pub failed: usize,
    pub converted: usize,
    pub conversion_failed: usize,
    pub kept: usize,
    pub filtered_out: usize,
    /// Resources with chunks.
    pub chunked: usize,
    pub chunk_failed: usize,
    pub chunks_total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interruption {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Latest state per stage; untouched stages are omitted.
    pub stages: BTreeMap<Stage, UnitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter: Option<ConverterKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_reason: Option<FilterReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

/// Contents of `chunk_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub resources: usize,
    pub chunks: usize,
    pub tokens: usize,
    pub max_chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub entries: Vec<ChunkSummaryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummaryEntry {
    pub resource_id: ResourceId,
    /// Chunk directory relative to `chunks/`.
    pub path: String,
    pub chunks: usize,
    pub tokens: usize,
}

/// Assemble the manifest from the run state and the artifacts on disk.
pub(crate) fn build(
    state: &RunState,
    layout: &RunLayout,
    errors: Vec<UnitFailure>,
    run: RunHeader,
    interruption: Option<Interruption>,
) -> Result<RunManifest> {
    // The decision log is append-only; the last line for an id wins.
    let decisions: HashMap<ResourceId, FilterReason> =
        read_jsonl::<FilterDecision>(&layout.filter_decisions())?
            .into_iter()
            .map(|d| (d.resource_id, d.reason))
            .collect();

    let mut counts = ManifestCounts {
        fetched: state.count(Stage::Crawl, UnitState::Fetched),
        failed: state.count(Stage::Crawl, UnitState::Failed),
        converted: state.count(Stage::Convert, UnitState::Converted),
        conversion_failed: state.count(Stage::Convert, UnitState::ConversionFailed),
        kept: state.count(Stage::Filter, UnitState::Kept),
        filtered_out: state.count(Stage::Filter, UnitState::FilteredOut),
        chunked: state.count(Stage::Chunk, UnitState::Chunked),
        chunk_failed: state.count(Stage::Chunk, UnitState::ChunkFailed),
        chunks_total: 0,
    };

    let mut resources = Vec::with_capacity(state.resources.len());
    for resource in &state.resources {
        let stages: BTreeMap<Stage, UnitState> = Stage::ALL
            .iter()
            .map(|&stage| (stage, state.unit_state(stage, &resource.id)))
            .filter(|(_, unit)| *unit != UnitState::Pending)
            .collect();

        let converter = match stages.get(&Stage::Convert) {
            Some(UnitState::Converted) => {
                Some(layout.load_converted(&resource.id)?.converter_used)
            }
            _ => None,
        };
        let filter_reason = match stages.get(&Stage::Filter) {
            Some(UnitState::Kept | UnitState::FilteredOut) => {
                decisions.get(&resource.id).cloned()
            }
            _ => None,
        };
        let chunks = match stages.get(&Stage::Chunk) {
            Some(UnitState::Chunked) => Some(
                layout
                    .load_chunks(&tree_path(state, resource), &resource.id)?
                    .len(),
            ),
            _ => None,
        };
        counts.chunks_total += chunks.unwrap_or(0);

        resources.push(ManifestResource {
            id: resource.id.clone(),
            kind: resource.kind,
            title: resource.title.clone(),
            parent_id: resource.parent_id.clone(),
            content_hash: resource.content_hash.clone(),
            stages,
            converter,
            filter_reason,
            chunks,
        });
    }

    Ok(RunManifest {
        run,
        body: ManifestBody {
            course_url: state.course_url.clone(),
            status: state.status,
            stage_cursor: state.stage_cursor,
            counts,
            interruption,
            resources,
            errors,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(status: RunStatus) -> RunManifest {
        RunManifest {
            run: RunHeader {
                run_id: RunId::new(),
                created_at: Utc::now(),
                finished_at: None,
                duration_ms: 12,
            },
            body: ManifestBody {
                course_url: "https://canvas.example.edu/courses/7".into(),
                status,
                stage_cursor: Some(Stage::Convert),
                counts: ManifestCounts::default(),
                interruption: None,
                resources: Vec::new(),
                errors: Vec::new(),
            },
        }
    }

    #[test]
    fn only_partial_runs_exit_non_zero() {
        assert_eq!(manifest(RunStatus::Completed).exit_code(), 0);
        assert_eq!(manifest(RunStatus::Suspended).exit_code(), 0);
        assert_eq!(manifest(RunStatus::Partial).exit_code(), PARTIAL_EXIT_CODE);
    }

    #[test]
    fn body_is_flattened_next_to_run_header() {
        let value = serde_json::to_value(manifest(RunStatus::Suspended)).unwrap();
        assert_eq!(value["status"], "suspended");
        assert_eq!(value["stage_cursor"], "convert");
        assert_eq!(value["run"]["duration_ms"], 12);
        assert!(value.get("interruption").is_none());

        let back: RunManifest = serde_json::from_value(value).unwrap();
        assert_eq!(back.body.status, RunStatus::Suspended);
    }
}
