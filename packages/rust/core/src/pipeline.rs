//! End-to-end run: crawl → convert → filter → chunk over one course.
//!
//! Stages run strictly one after another. Every unit transition is appended
//! to the run's state database as it happens, so a crash loses at most the
//! units in flight, and `resume` continues from the first non-terminal unit of
//! each stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use coursepipe_crawler::{Crawler, FetchPolicy, SourceApi};
use coursepipe_markdown::ConversionChain;
use coursepipe_shared::{
    CourseRef, PipelineConfig, PipelineError, Result, RunId, RunState, RunStatus, Stage,
    UnitState,
};
use coursepipe_storage::{RunLayout, RunStore, read_json, write_atomic, write_json};

use crate::manifest::{self, Interruption, RunHeader, RunManifest};
use crate::progress::ProgressReporter;
use crate::stages::{self, StageContext};

/// Per-invocation switches that are not part of the pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue the run found in the run directory.
    pub resume: bool,
    /// On resume, reopen units that ended `failed`, `conversion_failed`, or
    /// `chunk_failed`.
    pub retry_failed: bool,
    /// Explicit run directory; otherwise `<runs_root>/<run_name>`.
    pub run_dir: Option<PathBuf>,
}

/// Result of the `run` pipeline.
#[derive(Debug)]
pub struct RunOutcome {
    pub manifest: RunManifest,
    pub run_dir: PathBuf,
}

/// Directory of the run `config` describes.
pub fn resolve_run_dir(config: &PipelineConfig, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    let name = match &config.run.run_name {
        Some(name) => name.clone(),
        None => format!("course-{}", CourseRef::parse(&config.course_url)?.course_id),
    };
    Ok(config.run.runs_root.join(name))
}

/// Run the selected stages.
///
/// Configuration problems (including a selected stage whose predecessor is
/// incomplete) fail before any stage starts. A stage-level failure or a
/// cancellation ends the run `partial` and is reported through the returned
/// manifest rather than as an error.
#[instrument(skip_all, fields(course_url = %config.course_url, steps = ?config.steps))]
pub async fn run(
    config: &PipelineConfig,
    options: RunOptions,
    api: Arc<dyn SourceApi>,
    chain: &ConversionChain,
    progress: &dyn ProgressReporter,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let started = Instant::now();
    config.validate()?;
    let course = CourseRef::parse(&config.course_url)?;
    let run_dir = resolve_run_dir(config, options.run_dir.as_deref())?;
    let selected = config.steps.stages();

    // --- Open or create run state ---
    let existing = RunLayout::new(&run_dir).state_db().exists();
    let store = if existing {
        if !options.resume {
            return Err(PipelineError::config(format!(
                "{} already holds a run; pass --resume to continue it",
                run_dir.display()
            )));
        }
        RunStore::open(&run_dir).await?
    } else {
        if options.resume {
            info!(dir = %run_dir.display(), "nothing to resume, starting a new run");
        }
        check_prerequisites(&selected, &blank_state(config))?;
        RunStore::create(&run_dir, &RunId::new(), &config.course_url).await?
    };

    let mut state = store.load_state().await?;
    if state.course_url != config.course_url {
        return Err(PipelineError::config(format!(
            "{} belongs to {}, not {}",
            run_dir.display(),
            state.course_url,
            config.course_url
        )));
    }
    if options.retry_failed {
        reopen_failed(&store, &mut state).await?;
    }
    check_prerequisites(&selected, &state)?;

    write_atomic(&store.layout().config_used(), config.to_toml()?.as_bytes())?;
    info!(
        run_id = %state.run_id,
        dir = %run_dir.display(),
        resume = existing,
        stages = ?selected,
        "starting run"
    );

    // --- Stages ---
    let crawler = Crawler::new(api, course, FetchPolicy::from(&config.crawl));
    let ctx = StageContext {
        config,
        store: &store,
        progress,
        cancel: &cancel,
    };

    let mut interruption = None;
    for &stage in &selected {
        state.status = stage.running_status();
        store.set_status(state.status, state.stage_cursor).await?;

        let result = match stage {
            Stage::Crawl => stages::crawl::run(&ctx, &mut state, &crawler).await,
            Stage::Convert => stages::convert::run(&ctx, &mut state, chain).await,
            Stage::Filter => stages::filter::run(&ctx, &mut state).await,
            Stage::Chunk => stages::chunk::run(&ctx, &mut state).await,
        };
        state.stage_cursor = resolved_cursor(&state);

        if let Err(e) = result {
            match &e {
                PipelineError::Cancelled => warn!(stage = %stage, "run cancelled"),
                _ => {
                    error!(stage = %stage, error = %e, "stage aborted");
                    store.record_error(stage, None, &e).await?;
                }
            }
            interruption = Some(Interruption {
                stage,
                reason: e.to_string(),
            });
            break;
        }
    }

    // --- Final status and manifest ---
    state.status = if interruption.is_some() {
        RunStatus::Partial
    } else if state.stage_cursor == Some(Stage::Chunk) {
        RunStatus::Completed
    } else {
        RunStatus::Suspended
    };
    store.set_status(state.status, state.stage_cursor).await?;

    let header = RunHeader {
        run_id: state.run_id.clone(),
        created_at: state.created_at,
        finished_at: Some(Utc::now()),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let failures = store.unit_failures().await?;
    let manifest = manifest::build(&state, store.layout(), failures, header, interruption)?;
    write_json(&store.layout().manifest(), &manifest)?;

    progress.done(&manifest);
    info!(
        status = state.status.as_str(),
        fetched = manifest.body.counts.fetched,
        converted = manifest.body.counts.converted,
        chunked = manifest.body.counts.chunked,
        elapsed_ms = manifest.run.duration_ms,
        "run finished"
    );

    Ok(RunOutcome { manifest, run_dir })
}

/// Current manifest of a run directory, without modifying it.
///
/// Counts come from the state database; timing and the interruption note
/// from the last `manifest.json`, if one was written.
pub async fn inspect(run_dir: &Path) -> Result<RunManifest> {
    let store = RunStore::open_readonly(run_dir).await?;
    let state = store.load_state().await?;
    let previous: Option<RunManifest> = {
        let path = store.layout().manifest();
        if path.exists() {
            Some(read_json(&path)?)
        } else {
            None
        }
    };

    let (header, interruption) = match previous {
        Some(m) => {
            let interruption = match state.status {
                RunStatus::Partial => m.body.interruption,
                _ => None,
            };
            (m.run, interruption)
        }
        None => (
            RunHeader {
                run_id: state.run_id.clone(),
                created_at: state.created_at,
                finished_at: None,
                duration_ms: 0,
            },
            None,
        ),
    };
    let failures = store.unit_failures().await?;
    manifest::build(&state, store.layout(), failures, header, interruption)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn blank_state(config: &PipelineConfig) -> RunState {
    RunState::new(RunId::new(), config.course_url.clone(), Utc::now())
}

/// Last stage such that it and every stage before it are fully resolved.
fn resolved_cursor(state: &RunState) -> Option<Stage> {
    Stage::ALL
        .iter()
        .copied()
        .take_while(|&stage| state.stage_resolved(stage))
        .last()
}

/// Every selected stage must either have its predecessor selected too or
/// find it already resolved.
fn check_prerequisites(selected: &[Stage], state: &RunState) -> Result<()> {
    let cursor = resolved_cursor(state);
    for stage in selected {
        let Some(previous) = stage.previous() else {
            continue;
        };
        let ready = cursor.is_some_and(|c| c >= previous);
        if !selected.contains(&previous) && !ready {
            return Err(PipelineError::config(format!(
                "step '{stage}' needs '{previous}' to be complete; run '{previous}' first or select both"
            )));
        }
    }
    Ok(())
}

/// Return failed units to `pending` so this invocation retries them.
async fn reopen_failed(store: &RunStore, state: &mut RunState) -> Result<()> {
    let mut reopened = 0usize;
    for stage in Stage::ALL {
        let failed: Vec<_> = state
            .resources
            .iter()
            .filter(|r| {
                matches!(
                    state.unit_state(stage, &r.id),
                    UnitState::Failed | UnitState::ConversionFailed | UnitState::ChunkFailed
                )
            })
            .map(|r| r.id.clone())
            .collect();
        for id in failed {
            store
                .record_unit(stage, &id, UnitState::Pending, 0, Some("reopened"))
                .await?;
            state.set_unit_state(stage, id, UnitState::Pending);
            reopened += 1;
        }
    }
    if reopened > 0 {
        info!(reopened, "reopened failed units");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use uuid::Uuid;

    use coursepipe_crawler::Download;
    use coursepipe_markdown::{Candidate, ChainLink, DocumentConverter, PrimaryConverter};
    use coursepipe_shared::{
        ConverterKind, FilterDecision, FilterReason, RawPayload, ResourceId, StepSelection,
    };

    use super::*;
    use crate::progress::SilentProgress;

    const PDF_URL: &str = "https://files.example.edu/500/download";

    fn words(topic: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{topic}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Three pages (one titled "Exam 1") and one PDF.
    struct FakeCourse {
        collections: HashMap<String, Vec<Value>>,
        objects: HashMap<String, Value>,
        fail_listing: bool,
        fetches: AtomicUsize,
    }

    impl FakeCourse {
        fn new() -> Self {
            Self::with_pages(
                [
                    ("welcome", "Welcome", "welcome"),
                    ("week-1-notes", "Week 1 Notes", "notes"),
                    ("exam-1", "Exam 1", "exam"),
                ]
                .map(|(slug, title, topic)| {
                    (
                        slug.to_string(),
                        title.to_string(),
                        format!("<p>{}</p><p>{}</p>", words(topic, 40), words(topic, 30)),
                    )
                }),
            )
        }

        /// The listed pages as `(slug, title, body)`, followed by the PDF.
        fn with_pages(pages: impl IntoIterator<Item = (String, String, String)>) -> Self {
            let pages: Vec<_> = pages.into_iter().collect();
            let mut collections = HashMap::new();
            let mut objects = HashMap::new();
            collections.insert(
                "courses/7/pages".to_string(),
                pages
                    .iter()
                    .map(|(slug, title, _)| json!({"url": slug, "title": title, "published": true}))
                    .collect(),
            );
            for (slug, title, body) in pages {
                objects.insert(
                    format!("courses/7/pages/{slug}"),
                    json!({
                        "url": slug,
                        "title": title,
                        "published": true,
                        "body": body,
                    }),
                );
            }
            collections.insert(
                "courses/7/files".to_string(),
                vec![json!({"id": 500, "display_name": "lecture-notes.pdf"})],
            );
            objects.insert(
                "courses/7/files/500".to_string(),
                json!({
                    "id": 500,
                    "display_name": "lecture-notes.pdf",
                    "url": PDF_URL,
                    "content-type": "application/pdf",
                }),
            );
            Self {
                collections,
                objects,
                fail_listing: false,
                fetches: AtomicUsize::new(0),
            }
        }

        /// `n` distinct pages, then a copy of the first one.
        fn many_pages(n: usize) -> Self {
            let page = |i: usize, slug: String| {
                (
                    slug,
                    format!("Topic {i}"),
                    format!("<p>{}</p>", words(&format!("t{i}w"), 60)),
                )
            };
            Self::with_pages(
                (0..n)
                    .map(|i| page(i, format!("topic-{i}")))
                    .chain(std::iter::once(page(0, "topic-copy".to_string()))),
            )
        }

        /// Two pages with the same title and body, "a" listed first.
        fn twins() -> Self {
            Self::with_pages(["a", "b"].map(|slug| {
                (
                    slug.to_string(),
                    "Reading".to_string(),
                    format!("<p>{}</p>", words("reading", 80)),
                )
            }))
        }

        fn without_object(mut self, path: &str) -> Self {
            self.objects.remove(path);
            self
        }
    }

    #[async_trait]
    impl SourceApi for FakeCourse {
        async fn get_collection(&self, path: &str) -> Result<Vec<Value>> {
            if self.fail_listing {
                return Err(PipelineError::Source("401 Unauthorized".into()));
            }
            let key = path.split('?').next().unwrap_or(path);
            self.collections
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(path.to_string()))
        }

        async fn get_object(&self, path: &str) -> Result<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let key = path.split('?').next().unwrap_or(path);
            self.objects
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(path.to_string()))
        }

        async fn download(&self, url: &str) -> Result<Download> {
            if url == PDF_URL {
                Ok(Download {
                    mime_type: "application/pdf".into(),
                    bytes: b"%PDF-1.4 lecture notes".to_vec(),
                })
            } else {
                Err(PipelineError::NotFound(url.to_string()))
            }
        }
    }

    /// Stands in for PDF text extraction.
    struct PdfText;

    #[async_trait]
    impl DocumentConverter for PdfText {
        fn name(&self) -> &'static str {
            "pdf-text"
        }

        fn kind(&self) -> ConverterKind {
            ConverterKind::Fallback
        }

        async fn convert(&self, payload: &RawPayload) -> Result<Candidate> {
            if payload.mime_type != "application/pdf" {
                return Err(PipelineError::Conversion("not a PDF".into()));
            }
            Ok(Candidate {
                markdown: format!("# Lecture notes\n\n{}\n", words("lecture", 80)),
                confidence: Some(0.9),
                warnings: Vec::new(),
            })
        }
    }

    fn chain() -> ConversionChain {
        ConversionChain::new(
            vec![
                ChainLink::new(Arc::new(PrimaryConverter::default()), 0.5),
                ChainLink::new(Arc::new(PdfText), 0.5),
            ],
            Duration::from_secs(5),
        )
    }

    fn config(steps: &str) -> PipelineConfig {
        let mut config = PipelineConfig {
            course_url: "https://canvas.example.edu/courses/7".into(),
            min_tokens: 50,
            steps: steps.parse::<StepSelection>().unwrap(),
            ..PipelineConfig::default()
        };
        config.crawl.retry_budget = 0;
        config.crawl.backoff_ms = 0;
        config.crawl.workers = 1;
        config.convert.workers = 1;
        config
    }

    fn temp_run_dir() -> PathBuf {
        std::env::temp_dir().join(format!("coursepipe-run-{}", Uuid::now_v7()))
    }

    fn options(dir: &Path, resume: bool) -> RunOptions {
        RunOptions {
            resume,
            retry_failed: false,
            run_dir: Some(dir.to_path_buf()),
        }
    }

    async fn run_with(
        config: &PipelineConfig,
        options: RunOptions,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        run_on(FakeCourse::new(), config, options, progress, cancel).await
    }

    async fn run_on(
        course: FakeCourse,
        config: &PipelineConfig,
        options: RunOptions,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        run(config, options, Arc::new(course), &chain(), progress, cancel).await
    }

    fn with_workers(mut config: PipelineConfig, workers: usize) -> PipelineConfig {
        config.crawl.workers = workers;
        config.convert.workers = workers;
        config
    }

    /// Cancels the run once `after` units of `stage` have finished.
    struct CancelAfter {
        stage: Stage,
        after: usize,
        seen: AtomicUsize,
        token: CancellationToken,
    }

    impl ProgressReporter for CancelAfter {
        fn stage_started(&self, _stage: Stage, _pending: usize) {}
        fn unit_finished(&self, stage: Stage, _id: &ResourceId, _state: UnitState) {
            if stage == self.stage && self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
        }
        fn stage_finished(&self, _stage: Stage) {}
        fn done(&self, _manifest: &RunManifest) {}
    }

    #[tokio::test]
    async fn course_scenario_counts() {
        let dir = temp_run_dir();
        let outcome = run_with(
            &config("all"),
            options(&dir, false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let body = &outcome.manifest.body;
        assert_eq!(body.status, RunStatus::Completed);
        assert_eq!(body.stage_cursor, Some(Stage::Chunk));
        assert_eq!(body.counts.fetched, 4);
        assert_eq!(body.counts.converted, 4);
        assert_eq!(body.counts.filtered_out, 1);
        assert_eq!(body.counts.chunked, 3);
        assert_eq!(outcome.manifest.exit_code(), 0);

        let ids: Vec<&str> = body.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["page-welcome", "page-week-1-notes", "page-exam-1", "file-500"]
        );
        let exam = &body.resources[2];
        assert_eq!(exam.filter_reason, Some(FilterReason::BlacklistedTitle));
        assert_eq!(exam.chunks, None);
        let pdf = &body.resources[3];
        assert_eq!(pdf.converter, Some(ConverterKind::Fallback));
        assert_eq!(body.resources[0].converter, Some(ConverterKind::Primary));

        let layout = RunLayout::new(&dir);
        assert!(layout.manifest().exists());
        assert!(layout.config_used().exists());
        assert!(layout.chunk_summary().exists());
        assert!(layout.chunk_dir(Path::new(""), &"file-500".into()).join("0000.md").exists());
        let chunks_jsonl = std::fs::read_to_string(layout.chunks_jsonl()).unwrap();
        assert_eq!(chunks_jsonl.lines().count(), body.counts.chunks_total);
    }

    #[tokio::test]
    async fn resumed_run_matches_uninterrupted_run() {
        let reference = run_with(
            &config("all"),
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        for (stage, after) in [(Stage::Crawl, 1), (Stage::Convert, 2), (Stage::Filter, 3)] {
            let dir = temp_run_dir();
            let token = CancellationToken::new();
            let reporter = CancelAfter {
                stage,
                after,
                seen: AtomicUsize::new(0),
                token: token.clone(),
            };
            let interrupted = run_with(&config("all"), options(&dir, false), &reporter, token)
                .await
                .unwrap();
            assert_eq!(interrupted.manifest.body.status, RunStatus::Partial);
            assert_eq!(interrupted.manifest.exit_code(), 2);
            let interruption = interrupted.manifest.body.interruption.clone().unwrap();
            assert_eq!(interruption.stage, stage);

            let resumed = run_with(
                &config("all"),
                options(&dir, true),
                &SilentProgress,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(resumed.manifest.body, reference.manifest.body, "interrupted in {stage}");
        }
    }

    #[tokio::test]
    async fn parallel_workers_match_a_single_worker() {
        let reference = run_on(
            FakeCourse::many_pages(11),
            &config("all"),
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(reference.manifest.body.counts.fetched, 13);
        assert_eq!(reference.manifest.body.counts.filtered_out, 1);

        let parallel = with_workers(config("all"), 4);
        let outcome = run_on(
            FakeCourse::many_pages(11),
            &parallel,
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.manifest.body, reference.manifest.body);

        // One finished unit stops new work; at most a batch of four is in flight.
        for stage in [Stage::Crawl, Stage::Convert] {
            let dir = temp_run_dir();
            let token = CancellationToken::new();
            let reporter = CancelAfter {
                stage,
                after: 1,
                seen: AtomicUsize::new(0),
                token: token.clone(),
            };
            let interrupted = run_on(
                FakeCourse::many_pages(11),
                &parallel,
                options(&dir, false),
                &reporter,
                token,
            )
            .await
            .unwrap();
            assert_eq!(interrupted.manifest.body.status, RunStatus::Partial, "{stage}");

            let resumed = run_on(
                FakeCourse::many_pages(11),
                &parallel,
                options(&dir, true),
                &SilentProgress,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(resumed.manifest.body, reference.manifest.body, "interrupted in {stage}");
        }
    }

    #[tokio::test]
    async fn retried_earlier_copy_wins_the_duplicate_check() {
        let reference = run_on(
            FakeCourse::twins(),
            &config("all"),
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // The first copy fails to fetch, so the second one is kept.
        let dir = temp_run_dir();
        let first = run_on(
            FakeCourse::twins().without_object("courses/7/pages/a"),
            &config("all"),
            options(&dir, false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let body = &first.manifest.body;
        assert_eq!(body.counts.failed, 1);
        assert_eq!(body.resources[1].filter_reason, Some(FilterReason::None));
        assert!(body.resources[1].chunks.is_some());

        let retry = RunOptions {
            resume: true,
            retry_failed: true,
            run_dir: Some(dir.clone()),
        };
        let second = run_on(
            FakeCourse::twins(),
            &config("all"),
            retry,
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let body = &second.manifest.body;
        assert_eq!(body.resources[0].id, ResourceId::from("page-a"));
        assert_eq!(body.resources[0].filter_reason, Some(FilterReason::None));
        assert!(body.resources[0].chunks.is_some());
        assert_eq!(
            body.resources[1].filter_reason,
            Some(FilterReason::DuplicateOf(ResourceId::from("page-a")))
        );
        assert_eq!(body.resources[1].chunks, None);
        assert_eq!(*body, reference.manifest.body);

        let layout = RunLayout::new(&dir);
        assert!(!layout.chunk_dir(Path::new(""), &"page-b".into()).exists());
        let chunks_jsonl = std::fs::read_to_string(layout.chunks_jsonl()).unwrap();
        assert_eq!(chunks_jsonl.lines().count(), body.counts.chunks_total);
        assert!(!chunks_jsonl.contains("\"page-b\""));
    }

    #[tokio::test]
    async fn decision_logged_before_a_crash_is_superseded_on_resume() {
        let reference = run_with(
            &config("all"),
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let dir = temp_run_dir();
        let token = CancellationToken::new();
        let reporter = CancelAfter {
            stage: Stage::Filter,
            after: 1,
            seen: AtomicUsize::new(0),
            token: token.clone(),
        };
        run_with(&config("all"), options(&dir, false), &reporter, token)
            .await
            .unwrap();

        // A decision line written just before the process died, with no unit
        // event behind it.
        let layout = RunLayout::new(&dir);
        coursepipe_storage::append_jsonl(
            &layout.filter_decisions(),
            &FilterDecision::drop("page-week-1-notes".into(), FilterReason::BelowTokenThreshold),
        )
        .unwrap();
        let stale = inspect(&dir).await.unwrap();
        assert_eq!(stale.body.resources[1].filter_reason, None);

        let resumed = run_with(
            &config("all"),
            options(&dir, true),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.manifest.body, reference.manifest.body);
        let lines = std::fs::read_to_string(layout.filter_decisions()).unwrap();
        assert_eq!(
            lines.lines().filter(|l| l.contains("page-week-1-notes")).count(),
            2
        );
    }

    #[tokio::test]
    async fn sequential_steps_match_all_steps() {
        let reference = run_with(
            &config("all"),
            options(&temp_run_dir(), false),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let dir = temp_run_dir();
        let mut last = None;
        for (i, step) in ["crawl", "convert", "filter", "chunk"].iter().enumerate() {
            let outcome = run_with(
                &config(step),
                options(&dir, i > 0),
                &SilentProgress,
                CancellationToken::new(),
            )
            .await
            .unwrap();
            if *step != "chunk" {
                assert_eq!(outcome.manifest.body.status, RunStatus::Suspended);
            }
            last = Some(outcome);
        }
        assert_eq!(last.unwrap().manifest.body, reference.manifest.body);
    }

    #[tokio::test]
    async fn existing_run_requires_resume() {
        let dir = temp_run_dir();
        run_with(&config("crawl"), options(&dir, false), &SilentProgress, CancellationToken::new())
            .await
            .unwrap();
        let err = run_with(&config("crawl"), options(&dir, false), &SilentProgress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[tokio::test]
    async fn step_without_prerequisite_is_rejected_before_any_state() {
        let dir = temp_run_dir();
        let err = run_with(&config("filter"), options(&dir, false), &SilentProgress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
        assert!(!RunLayout::new(&dir).state_db().exists());

        run_with(&config("crawl"), options(&dir, false), &SilentProgress, CancellationToken::new())
            .await
            .unwrap();
        let err = run_with(&config("chunk"), options(&dir, true), &SilentProgress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'filter'"));
    }

    #[tokio::test]
    async fn unreachable_source_leaves_run_partial() {
        let dir = temp_run_dir();
        let mut api = FakeCourse::new();
        api.fail_listing = true;
        let outcome = run(
            &config("all"),
            options(&dir, false),
            Arc::new(api),
            &chain(),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.manifest.body.status, RunStatus::Partial);
        assert_eq!(outcome.manifest.body.stage_cursor, None);
        let interruption = outcome.manifest.body.interruption.unwrap();
        assert_eq!(interruption.stage, Stage::Crawl);
        assert!(interruption.reason.contains("401"));

        // Once the source is reachable, resuming completes the run.
        let resumed = run_with(&config("all"), options(&dir, true), &SilentProgress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.manifest.body.status, RunStatus::Completed);
        assert_eq!(resumed.manifest.body.counts.fetched, 4);
    }

    #[tokio::test]
    async fn resuming_a_finished_run_refetches_nothing() {
        let dir = temp_run_dir();
        run_with(&config("all"), options(&dir, false), &SilentProgress, CancellationToken::new())
            .await
            .unwrap();

        let api = Arc::new(FakeCourse::new());
        let outcome = run(
            &config("all"),
            options(&dir, true),
            api.clone(),
            &chain(),
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.manifest.body.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn inspect_reports_interrupted_run() {
        let dir = temp_run_dir();
        let token = CancellationToken::new();
        let reporter = CancelAfter {
            stage: Stage::Crawl,
            after: 2,
            seen: AtomicUsize::new(0),
            token: token.clone(),
        };
        run_with(&config("all"), options(&dir, false), &reporter, token)
            .await
            .unwrap();

        let manifest = inspect(&dir).await.unwrap();
        assert_eq!(manifest.body.status, RunStatus::Partial);
        assert_eq!(manifest.body.counts.fetched, 2);
        assert_eq!(
            manifest.body.interruption.map(|i| i.stage),
            Some(Stage::Crawl)
        );
    }

    #[test]
    fn default_run_dir_is_named_after_the_course() {
        let config = config("all");
        assert_eq!(
            resolve_run_dir(&config, None).unwrap(),
            PathBuf::from("runs").join("course-7")
        );
        assert_eq!(
            resolve_run_dir(&config, Some(Path::new("/tmp/x"))).unwrap(),
            PathBuf::from("/tmp/x")
        );
    }
}
