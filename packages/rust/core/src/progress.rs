//! Progress callbacks for front ends.

use coursepipe_shared::{ResourceId, Stage, UnitState};

use crate::manifest::RunManifest;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts, with the number of units left to process.
    fn stage_started(&self, stage: Stage, pending: usize);
    /// Called after each unit reaches a terminal state.
    fn unit_finished(&self, stage: Stage, resource_id: &ResourceId, state: UnitState);
    /// Called when a stage stops, whether or not it resolved every unit.
    fn stage_finished(&self, stage: Stage);
    /// Called once the manifest is written.
    fn done(&self, manifest: &RunManifest);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: Stage, _pending: usize) {}
    fn unit_finished(&self, _stage: Stage, _resource_id: &ResourceId, _state: UnitState) {}
    fn stage_finished(&self, _stage: Stage) {}
    fn done(&self, _manifest: &RunManifest) {}
}
