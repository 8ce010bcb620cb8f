//! Crawl stage: enumerate the course once, then fetch every listed resource
//! into the payload archive.

use futures::{StreamExt, future, stream};
use tracing::{info, instrument, warn};

use coursepipe_crawler::Crawler;
use coursepipe_shared::{PipelineError, Resource, Result, RunState, Stage, UnitState};

use super::{StageContext, UnitReport, pending};

#[instrument(skip_all, fields(stage = "crawl"))]
pub(crate) async fn run(
    ctx: &StageContext<'_>,
    state: &mut RunState,
    crawler: &Crawler,
) -> Result<()> {
    if !state.listing_complete {
        let listed = crawler.list_resources(&ctx.config.include).await?;
        let mut added = 0usize;
        for resource in listed {
            // Ids already recorded by an interrupted listing keep their order.
            if ctx.store.record_resource(&resource).await? {
                state.resources.push(resource);
                added += 1;
            }
        }
        ctx.store.set_listing_complete().await?;
        state.listing_complete = true;
        info!(added, total = state.resources.len(), "listing recorded");
    }

    let todo = pending(state, Stage::Crawl);
    ctx.progress.stage_started(Stage::Crawl, todo.len());

    // Stops handing out new units; in-flight fetches still finish.
    let stop = ctx.cancel.child_token();
    let mut fatal: Option<PipelineError> = None;
    {
        let mut results = stream::iter(todo)
            .take_while(|_| future::ready(!stop.is_cancelled()))
            .map(|resource| fetch_one(ctx, crawler, resource))
            .buffer_unordered(ctx.config.crawl.workers);

        while let Some(report) = results.next().await {
            match report {
                Ok(report) => ctx.apply(state, Stage::Crawl, report),
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
    ctx.finish(state, Stage::Crawl)
}

/// Fetch and archive one resource. Only errors that make the source unusable
/// (or the run directory unwritable) escape; the rest fail the unit.
async fn fetch_one(
    ctx: &StageContext<'_>,
    crawler: &Crawler,
    resource: Resource,
) -> Result<UnitReport> {
    let store = ctx.store;
    store
        .record_unit(Stage::Crawl, &resource.id, UnitState::Fetching, 1, None)
        .await?;

    let (result, attempts) = crawler.fetch_with_retry(&resource).await;
    match result {
        Ok(payload) => {
            store.layout().save_payload(&payload)?;
            store
                .set_content_hash(&resource.id, &payload.content_hash)
                .await?;
            store
                .record_unit(Stage::Crawl, &resource.id, UnitState::Fetched, attempts, None)
                .await?;
            Ok(UnitReport {
                resource_id: resource.id,
                state: UnitState::Fetched,
                content_hash: Some(payload.content_hash),
            })
        }
        Err(e @ PipelineError::Source(_)) => Err(e),
        Err(e) => {
            warn!(resource_id = %resource.id, attempts, error = %e, "fetch failed");
            store
                .record_error(Stage::Crawl, Some(&resource.id), &e)
                .await?;
            store
                .record_unit(
                    Stage::Crawl,
                    &resource.id,
                    UnitState::Failed,
                    attempts,
                    Some(&e.to_string()),
                )
                .await?;
            Ok(UnitReport::new(resource.id, UnitState::Failed))
        }
    }
}
