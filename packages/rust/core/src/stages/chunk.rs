//! Chunk stage: split kept documents and write the chunk tree plus the
//! run-wide `chunks.jsonl` and `chunk_summary.json`.

use tracing::{instrument, warn};

use coursepipe_chunker::{render_chunk_file, split};
use coursepipe_shared::{Chunk, Resource, Result, RunState, Stage, UnitState};
use coursepipe_storage::{write_json, write_jsonl};

use super::{StageContext, UnitReport, pending, tree_path};
use crate::manifest::{ChunkSummary, ChunkSummaryEntry};

#[instrument(skip_all, fields(stage = "chunk"))]
pub(crate) async fn run(ctx: &StageContext<'_>, state: &mut RunState) -> Result<()> {
    let todo = pending(state, Stage::Chunk);
    ctx.progress.stage_started(Stage::Chunk, todo.len());

    for resource in todo {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let unit = chunk_one(ctx, state, &resource).await?;
        ctx.apply(state, Stage::Chunk, UnitReport::new(resource.id, unit));
    }

    if state.stage_resolved(Stage::Chunk) {
        write_outputs(ctx, state)?;
    }
    ctx.finish(state, Stage::Chunk)
}

async fn chunk_one(
    ctx: &StageContext<'_>,
    state: &RunState,
    resource: &Resource,
) -> Result<UnitState> {
    let layout = ctx.store.layout();
    let document = layout.load_converted(&resource.id)?;

    let chunks = match split(
        &resource.id,
        &document.markdown,
        ctx.config.max_chunk_tokens,
        ctx.config.overlap_tokens,
    ) {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(resource_id = %resource.id, error = %e, "chunking failed");
            ctx.store
                .record_error(Stage::Chunk, Some(&resource.id), &e)
                .await?;
            ctx.store
                .record_unit(
                    Stage::Chunk,
                    &resource.id,
                    UnitState::ChunkFailed,
                    1,
                    Some(&e.to_string()),
                )
                .await?;
            return Ok(UnitState::ChunkFailed);
        }
    };

    let rendered: Option<Vec<String>> = ctx.config.chunk.write_files.then(|| {
        chunks
            .iter()
            .map(|c| render_chunk_file(resource, c, ctx.config.chunk.frontmatter))
            .collect()
    });
    layout.save_chunks(
        &tree_path(state, resource),
        &resource.id,
        &chunks,
        rendered.as_deref(),
    )?;
    ctx.store
        .record_unit(
            Stage::Chunk,
            &resource.id,
            UnitState::Chunked,
            1,
            Some(&format!("{} chunks", chunks.len())),
        )
        .await?;
    Ok(UnitState::Chunked)
}

/// Rebuild the run-wide chunk outputs from every chunked resource, in crawl
/// order.
fn write_outputs(ctx: &StageContext<'_>, state: &RunState) -> Result<()> {
    let layout = ctx.store.layout();
    let mut all: Vec<Chunk> = Vec::new();
    let mut entries = Vec::new();

    for resource in state.succeeded_in(Stage::Chunk) {
        let tree = tree_path(state, resource);
        let chunks = layout.load_chunks(&tree, &resource.id)?;
        entries.push(ChunkSummaryEntry {
            resource_id: resource.id.clone(),
            path: tree.join(resource.id.as_str()).to_string_lossy().into_owned(),
            chunks: chunks.len(),
            tokens: chunks.iter().map(|c| c.token_count).sum(),
        });
        all.extend(chunks);
    }

    write_jsonl(&layout.chunks_jsonl(), &all)?;
    write_json(
        &layout.chunk_summary(),
        &ChunkSummary {
            resources: entries.len(),
            chunks: all.len(),
            tokens: entries.iter().map(|e| e.tokens).sum(),
            max_chunk_tokens: ctx.config.max_chunk_tokens,
            overlap_tokens: ctx.config.overlap_tokens,
            entries,
        },
    )
}
