//! Filter stage. Runs sequentially in crawl order so the duplicate check
//! always keeps the earliest-discovered copy.
//!
//! A unit reopened by `--retry-failed` can sit earlier in crawl order than
//! units an earlier invocation already decided. Those later decisions were
//! made without it, so they are reopened and evaluated again behind it.

use tracing::{debug, info, instrument};

use coursepipe_filter::{CorpusContext, Filter};
use coursepipe_shared::{FilterDecision, FilterReason, Result, RunState, Stage, UnitState};
use coursepipe_storage::append_jsonl;

use super::{StageContext, UnitReport, pending, tree_path};

#[instrument(skip_all, fields(stage = "filter"))]
pub(crate) async fn run(ctx: &StageContext<'_>, state: &mut RunState) -> Result<()> {
    let filter = Filter::new(ctx.config)?;
    let layout = ctx.store.layout();

    reopen_decided_after_pending(ctx, state).await?;

    // Documents kept by an earlier invocation seed the duplicate index.
    let kept = state
        .inputs_for(Stage::Filter)
        .into_iter()
        .filter(|r| state.unit_state(Stage::Filter, &r.id) == UnitState::Kept)
        .map(|r| layout.load_converted(&r.id))
        .collect::<Result<Vec<_>>>()?;
    let mut corpus = CorpusContext::from_kept(&kept);

    let todo = pending(state, Stage::Filter);
    ctx.progress.stage_started(Stage::Filter, todo.len());

    for resource in todo {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let document = layout.load_converted(&resource.id)?;
        let decision = filter.evaluate(&resource.title, &document, &mut corpus);
        append_jsonl(&layout.filter_decisions(), &decision)?;

        let unit = if decision.kept {
            UnitState::Kept
        } else {
            debug!(resource_id = %resource.id, reason = decision.reason.as_str(), "dropped");
            UnitState::FilteredOut
        };
        ctx.store
            .record_unit(
                Stage::Filter,
                &resource.id,
                unit,
                1,
                Some(&decision_detail(&decision)),
            )
            .await?;
        ctx.apply(state, Stage::Filter, UnitReport::new(resource.id, unit));
    }

    ctx.finish(state, Stage::Filter)
}

/// Return every decided unit that follows the earliest pending one in crawl
/// order to `pending`, along with its chunk unit and chunk files.
async fn reopen_decided_after_pending(ctx: &StageContext<'_>, state: &mut RunState) -> Result<()> {
    let inputs = state.inputs_for(Stage::Filter);
    let Some(first_pending) = inputs
        .iter()
        .position(|r| !state.unit_state(Stage::Filter, &r.id).is_terminal())
    else {
        return Ok(());
    };
    let stale: Vec<_> = inputs[first_pending..]
        .iter()
        .filter(|r| state.unit_state(Stage::Filter, &r.id).is_terminal())
        .map(|r| (*r).clone())
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    let layout = ctx.store.layout();
    for resource in &stale {
        ctx.store
            .record_unit(
                Stage::Filter,
                &resource.id,
                UnitState::Pending,
                0,
                Some("re-evaluated"),
            )
            .await?;
        state.set_unit_state(Stage::Filter, resource.id.clone(), UnitState::Pending);

        if state.unit_state(Stage::Chunk, &resource.id) != UnitState::Pending {
            layout.remove_chunks(&tree_path(state, resource), &resource.id)?;
            ctx.store
                .record_unit(
                    Stage::Chunk,
                    &resource.id,
                    UnitState::Pending,
                    0,
                    Some("re-evaluated"),
                )
                .await?;
            state.set_unit_state(Stage::Chunk, resource.id.clone(), UnitState::Pending);
        }
    }
    info!(
        reopened = stale.len(),
        "filter decisions reopened behind an earlier pending document"
    );
    Ok(())
}

fn decision_detail(decision: &FilterDecision) -> String {
    match (&decision.reason, &decision.matched_pattern) {
        (FilterReason::DuplicateOf(first), _) => format!("duplicate-of {first}"),
        (reason, Some(pattern)) => format!("{} {pattern}", reason.as_str()),
        (reason, None) => reason.as_str().to_string(),
    }
}
