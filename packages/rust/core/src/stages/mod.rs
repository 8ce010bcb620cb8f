//! Stage drivers. Each stage reads the previous stage's persisted output,
//! skips units that are already terminal, and records every transition
//! through the [`RunStore`] before mirroring it into the in-memory state.

pub(crate) mod chunk;
pub(crate) mod convert;
pub(crate) mod crawl;
pub(crate) mod filter;

use std::collections::HashSet;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use coursepipe_shared::{
    PipelineConfig, PipelineError, Resource, ResourceId, Result, RunState, Stage, UnitState,
};
use coursepipe_storage::RunStore;

use crate::progress::ProgressReporter;

/// Deepest parent chain followed when building chunk output paths.
const MAX_TREE_DEPTH: usize = 16;

/// Everything a stage driver needs besides the run state.
pub(crate) struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub store: &'a RunStore,
    pub progress: &'a dyn ProgressReporter,
    pub cancel: &'a CancellationToken,
}

/// Terminal outcome of one unit, produced by a worker.
pub(crate) struct UnitReport {
    pub resource_id: ResourceId,
    pub state: UnitState,
    pub content_hash: Option<String>,
}

impl UnitReport {
    pub fn new(resource_id: ResourceId, state: UnitState) -> Self {
        Self {
            resource_id,
            state,
            content_hash: None,
        }
    }
}

impl StageContext<'_> {
    /// Mirror a persisted unit outcome into `state` and report it.
    pub fn apply(&self, state: &mut RunState, stage: Stage, report: UnitReport) {
        if let Some(hash) = report.content_hash {
            if let Some(resource) = state
                .resources
                .iter_mut()
                .find(|r| r.id == report.resource_id)
            {
                resource.content_hash = Some(hash);
            }
        }
        self.progress
            .unit_finished(stage, &report.resource_id, report.state);
        state.set_unit_state(stage, report.resource_id, report.state);
    }

    /// Close a stage: a cancelled stage with units left is an interruption.
    pub fn finish(&self, state: &RunState, stage: Stage) -> Result<()> {
        self.progress.stage_finished(stage);
        if !state.stage_resolved(stage) {
            return Err(PipelineError::Cancelled);
        }
        info!(
            stage = %stage,
            units = state.inputs_for(stage).len(),
            "stage resolved"
        );
        Ok(())
    }
}

/// Inputs of `stage` that have not reached a terminal state, in crawl order.
pub(crate) fn pending(state: &RunState, stage: Stage) -> Vec<Resource> {
    state
        .inputs_for(stage)
        .into_iter()
        .filter(|r| !state.unit_state(stage, &r.id).is_terminal())
        .cloned()
        .collect()
}

/// Chunk output directory of `resource` relative to `chunks/`, mirroring the
/// course hierarchy: `module-1/page-welcome` for a page inside module 1.
pub(crate) fn tree_path(state: &RunState, resource: &Resource) -> PathBuf {
    let mut ancestors = Vec::new();
    let mut seen = HashSet::from([resource.id.clone()]);
    let mut next = resource.parent_id.clone();

    while let Some(parent) = next.take() {
        if ancestors.len() == MAX_TREE_DEPTH || !seen.insert(parent.clone()) {
            break;
        }
        next = state.resource(&parent).and_then(|p| p.parent_id.clone());
        ancestors.push(parent);
    }

    ancestors.iter().rev().map(|id| id.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coursepipe_shared::{ResourceKind, RunId, Visibility};

    fn resource(id: &str, parent: Option<&str>) -> Resource {
        Resource {
            id: ResourceId::from(id),
            kind: ResourceKind::Page,
            title: id.into(),
            parent_id: parent.map(ResourceId::from),
            visibility: Visibility::StudentVisible,
            source_ref: String::new(),
            content_hash: None,
        }
    }

    #[test]
    fn tree_path_follows_parents_and_stops_on_cycles() {
        let mut state = RunState::new(RunId::new(), "https://x.edu/courses/1", Utc::now());
        state.resources = vec![
            resource("module-1", None),
            resource("module-item-5", Some("module-1")),
            resource("page-a", Some("module-item-5")),
            resource("page-loop", Some("page-loop-parent")),
            resource("page-loop-parent", Some("page-loop")),
        ];

        assert_eq!(tree_path(&state, &state.resources[0]), PathBuf::new());
        assert_eq!(
            tree_path(&state, &state.resources[2]),
            PathBuf::from("module-1/module-item-5")
        );
        assert_eq!(
            tree_path(&state, &state.resources[3]),
            PathBuf::from("page-loop-parent")
        );
    }

    #[test]
    fn missing_parent_still_names_the_directory() {
        let state = RunState::new(RunId::new(), "https://x.edu/courses/1", Utc::now());
        let orphan = resource("page-b", Some("module-9"));
        assert_eq!(tree_path(&state, &orphan), PathBuf::from("module-9"));
    }
}
