//! Convert stage: run every fetched payload through the fallback chain.

use futures::{StreamExt, future, stream};
use tracing::{instrument, warn};

use coursepipe_markdown::ConversionChain;
use coursepipe_shared::{PipelineError, Resource, Result, RunState, Stage, UnitState};
use coursepipe_storage::append_jsonl;

use super::{StageContext, UnitReport, pending};

#[instrument(skip_all, fields(stage = "convert", engines = ?chain.engines()))]
pub(crate) async fn run(
    ctx: &StageContext<'_>,
    state: &mut RunState,
    chain: &ConversionChain,
) -> Result<()> {
    let todo = pending(state, Stage::Convert);
    ctx.progress.stage_started(Stage::Convert, todo.len());

    let stop = ctx.cancel.child_token();
    let mut fatal: Option<PipelineError> = None;
    {
        let mut results = stream::iter(todo)
            .take_while(|_| future::ready(!stop.is_cancelled()))
            .map(|resource| convert_one(ctx, chain, resource))
            .buffer_unordered(ctx.config.convert.workers);

        while let Some(report) = results.next().await {
            match report {
                Ok(report) => ctx.apply(state, Stage::Convert, report),
                Err(e) => {
                    stop.cancel();
                    fatal.get_or_insert(e);
                }
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    ctx.finish(state, Stage::Convert)
}

/// Convert one archived payload. A chain failure fails the unit; an
/// unreadable archive or run directory aborts the stage.
async fn convert_one(
    ctx: &StageContext<'_>,
    chain: &ConversionChain,
    resource: Resource,
) -> Result<UnitReport> {
    let store = ctx.store;
    let layout = store.layout();
    store
        .record_unit(Stage::Convert, &resource.id, UnitState::Converting, 1, None)
        .await?;

    let payload = layout.load_payload(&resource.id)?;
    let outcome = chain.convert(&payload).await;
    for entry in &outcome.attempts {
        append_jsonl(&layout.ledger(), entry)?;
    }
    let attempts = u32::try_from(outcome.attempts.len()).unwrap_or(u32::MAX);

    match outcome.result {
        Ok(document) => {
            layout.save_converted(&document)?;
            store
                .record_unit(
                    Stage::Convert,
                    &resource.id,
                    UnitState::Converted,
                    attempts,
                    Some(document.converter_used.as_str()),
                )
                .await?;
            Ok(UnitReport::new(resource.id, UnitState::Converted))
        }
        Err(e) => {
            warn!(resource_id = %resource.id, error = %e, "conversion failed");
            store
                .record_error(Stage::Convert, Some(&resource.id), &e)
                .await?;
            store
                .record_unit(
                    Stage::Convert,
                    &resource.id,
                    UnitState::ConversionFailed,
                    attempts,
                    Some(&e.to_string()),
                )
                .await?;
            Ok(UnitReport::new(resource.id, UnitState::ConversionFailed))
        }
    }
}
