//! Run-state persistence on libSQL plus the run directory layout.
//!
//! The [`RunStore`] wraps the per-run database at `state/runstate.db`. Unit
//! transitions are appended to `unit_events` and never updated in place, so
//! concurrent workers only ever add independent rows. [`RunStore::load_state`]
//! folds the event log back into a [`RunState`].
//!
//! **Access rules:**
//! - the orchestrator: read-write (sole writer) via [`RunStore::create`] / [`RunStore::open`]
//! - `coursepipe status`: read-only via [`RunStore::open_readonly`]

mod layout;
mod migrations;

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};

use coursepipe_shared::{
    PipelineError, Resource, ResourceId, ResourceKind, Result, RunId, RunState, RunStatus, Stage,
    UnitState, Visibility,
};

pub use layout::{
    PayloadMeta, RunLayout, append_jsonl, read_json, read_jsonl, write_atomic, write_json,
    write_jsonl,
};

/// Latest failure recorded for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub resource_id: ResourceId,
    pub stage: Stage,
    pub state: UnitState,
    pub message: String,
}

/// A row of the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    pub recorded_at: String,
}

/// Handle on one run directory's state database.
pub struct RunStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    layout: RunLayout,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

impl RunStore {
    /// Create the state database for a new run. Fails if `dir` already holds one.
    pub async fn create(dir: &Path, run_id: &RunId, course_url: &str) -> Result<Self> {
        let layout = RunLayout::new(dir);
        let db_path = layout.state_db();
        if db_path.exists() {
            return Err(PipelineError::config(format!(
                "{} already holds a run; pass --resume to continue it",
                dir.display()
            )));
        }

        let store = Self::connect(layout, false).await?;
        store.run_migrations().await?;

        let now = Utc::now().to_rfc3339();
        store
            .conn
            .execute(
                "INSERT INTO runs (run_id, course_url, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    course_url,
                    RunStatus::Created.as_str(),
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;

        tracing::info!(run_id = %run_id, dir = %dir.display(), "created run state");
        Ok(store)
    }

    /// Open an existing run's state database in read-write mode.
    pub async fn open(dir: &Path) -> Result<Self> {
        let layout = RunLayout::new(dir);
        if !layout.state_db().exists() {
            return Err(PipelineError::config(format!(
                "no run state found in {}",
                dir.display()
            )));
        }
        let store = Self::connect(layout, false).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing run's state database without write access.
    pub async fn open_readonly(dir: &Path) -> Result<Self> {
        let layout = RunLayout::new(dir);
        if !layout.state_db().exists() {
            return Err(PipelineError::config(format!(
                "no run state found in {}",
                dir.display()
            )));
        }
        Self::connect(layout, true).await
    }

    async fn connect(layout: RunLayout, readonly: bool) -> Result<Self> {
        let path = layout.state_db();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(&path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            layout,
            readonly,
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PipelineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::Storage(
                "run state is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run record
    // -----------------------------------------------------------------------

    /// Persist the run's status and last fully-resolved stage.
    pub async fn set_status(&self, status: RunStatus, stage_cursor: Option<Stage>) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, stage_cursor = ?2, updated_at = ?3",
                params![status.as_str(), stage_cursor.map(|s| s.as_str()), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark the crawl's listing phase as finished.
    pub async fn set_listing_complete(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("UPDATE runs SET listing_complete = 1", params![])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    /// Record a listed resource. The first recording fixes its crawl order;
    /// later recordings of the same id are ignored.
    pub async fn record_resource(&self, resource: &Resource) -> Result<bool> {
        self.check_writable()?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO resources (id, kind, title, parent_id, visibility, source_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    resource.id.as_str(),
                    resource.kind.as_str(),
                    resource.title.as_str(),
                    resource.parent_id.as_ref().map(|p| p.as_str()),
                    visibility_str(resource.visibility),
                    resource.source_ref.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(inserted > 0)
    }

    pub async fn set_content_hash(&self, id: &ResourceId, hash: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE resources SET content_hash = ?1 WHERE id = ?2",
                params![hash, id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unit events and errors
    // -----------------------------------------------------------------------

    /// Append one unit transition.
    pub async fn record_unit(
        &self,
        stage: Stage,
        id: &ResourceId,
        state: UnitState,
        attempt: u32,
        detail: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO unit_events (resource_id, stage, state, attempt, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    stage.as_str(),
                    state.as_str(),
                    i64::from(attempt),
                    detail,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Append to the error log.
    pub async fn record_error(
        &self,
        stage: Stage,
        resource_id: Option<&ResourceId>,
        error: &PipelineError,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO errors (resource_id, stage, kind, message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    resource_id.map(|r| r.as_str()),
                    stage.as_str(),
                    error.kind(),
                    error.to_string(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn list_errors(&self) -> Result<Vec<ErrorRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT resource_id, stage, kind, message, recorded_at FROM errors ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let resource_id: Option<String> = row.get(0).ok();
            let stage: String = row.get(1).map_err(storage_err)?;
            results.push(ErrorRecord {
                resource_id: resource_id.map(ResourceId),
                stage: stage.parse().map_err(corrupt)?,
                kind: row.get(2).map_err(storage_err)?,
                message: row.get(3).map_err(storage_err)?,
                recorded_at: row.get(4).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    /// The latest failure message of every unit whose current state is a failure.
    pub async fn unit_failures(&self) -> Result<Vec<UnitFailure>> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.resource_id, e.stage, e.state, e.detail
                 FROM unit_events e
                 JOIN resources r ON r.id = e.resource_id
                 WHERE e.id IN (SELECT MAX(id) FROM unit_events GROUP BY stage, resource_id)
                 ORDER BY r.seq, e.stage",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let state: String = row.get(2).map_err(storage_err)?;
            let state: UnitState = state.parse()?;
            if !matches!(
                state,
                UnitState::Failed | UnitState::ConversionFailed | UnitState::ChunkFailed
            ) {
                continue;
            }
            let resource_id: String = row.get(0).map_err(storage_err)?;
            let stage: String = row.get(1).map_err(storage_err)?;
            let detail: Option<String> = row.get(3).ok();
            results.push(UnitFailure {
                resource_id: ResourceId(resource_id),
                stage: stage.parse().map_err(corrupt)?,
                state,
                message: detail.unwrap_or_default(),
            });
        }
        // Stage order, then crawl order within the stage.
        results.sort_by_key(|f| f.stage);
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // State loading
    // -----------------------------------------------------------------------

    /// Rebuild the run state from the database.
    pub async fn load_state(&self) -> Result<RunState> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, course_url, status, stage_cursor, listing_complete, created_at
                 FROM runs",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let row = rows
            .next()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| PipelineError::RunStateCorrupt("runs table is empty".into()))?;

        let run_id: String = row.get(0).map_err(storage_err)?;
        let run_id: RunId = run_id
            .parse()
            .map_err(|e| PipelineError::RunStateCorrupt(format!("bad run id: {e}")))?;
        let course_url: String = row.get(1).map_err(storage_err)?;
        let status: String = row.get(2).map_err(storage_err)?;
        let stage_cursor: Option<String> = row.get(3).ok();
        let listing_complete: i64 = row.get(4).map_err(storage_err)?;
        let created_at: String = row.get(5).map_err(storage_err)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| PipelineError::RunStateCorrupt(format!("bad created_at: {e}")))?
            .with_timezone(&Utc);

        let mut state = RunState::new(run_id, course_url, created_at);
        state.status = status.parse()?;
        state.stage_cursor = stage_cursor
            .map(|s| s.parse::<Stage>())
            .transpose()
            .map_err(corrupt)?;
        state.listing_complete = listing_complete != 0;
        state.resources = self.load_resources().await?;

        let known: HashSet<&str> = state.resources.iter().map(|r| r.id.as_str()).collect();
        let mut units = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT resource_id, stage, state FROM unit_events ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let resource_id: String = row.get(0).map_err(storage_err)?;
            let stage: String = row.get(1).map_err(storage_err)?;
            let unit_state: String = row.get(2).map_err(storage_err)?;
            if !known.contains(resource_id.as_str()) {
                return Err(PipelineError::RunStateCorrupt(format!(
                    "unit event for unknown resource '{resource_id}'"
                )));
            }
            units.push((
                stage.parse::<Stage>().map_err(corrupt)?,
                ResourceId(resource_id),
                unit_state.parse::<UnitState>()?,
            ));
        }
        for (stage, id, unit_state) in units {
            state.set_unit_state(stage, id, unit_state);
        }

        Ok(state)
    }

    async fn load_resources(&self) -> Result<Vec<Resource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, title, parent_id, visibility, source_ref, content_hash
                 FROM resources ORDER BY seq",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: String = row.get(0).map_err(storage_err)?;
            let kind: String = row.get(1).map_err(storage_err)?;
            let visibility: String = row.get(4).map_err(storage_err)?;
            let parent_id: Option<String> = row.get(3).ok();
            let content_hash: Option<String> = row.get(6).ok();
            results.push(Resource {
                id: ResourceId(id),
                kind: kind.parse::<ResourceKind>().map_err(corrupt)?,
                title: row.get(2).map_err(storage_err)?,
                parent_id: parent_id.map(ResourceId),
                visibility: parse_visibility(&visibility)?,
                source_ref: row.get(5).map_err(storage_err)?,
                content_hash,
            });
        }
        Ok(results)
    }
}

fn corrupt(e: PipelineError) -> PipelineError {
    PipelineError::RunStateCorrupt(e.to_string())
}

fn visibility_str(v: Visibility) -> &'static str {
    match v {
        Visibility::StudentVisible => "student-visible",
        Visibility::InstructorOnly => "instructor-only",
    }
}

fn parse_visibility(s: &str) -> Result<Visibility> {
    match s {
        "student-visible" => Ok(Visibility::StudentVisible),
        "instructor-only" => Ok(Visibility::InstructorOnly),
        other => Err(PipelineError::RunStateCorrupt(format!(
            "unknown visibility '{other}'"
        ))),
    }
}
