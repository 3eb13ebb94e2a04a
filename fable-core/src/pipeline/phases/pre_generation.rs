//! Loads everything the turn reads from the store.

use super::PhaseError;
use crate::capability::StoreError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::PipelineServices;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Snapshot the world, the knowledge entries and the recent history, one
/// read at a time.
pub async fn run(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PhaseError> {
    let input = ctx.user_input.trim();
    if input.is_empty() {
        return Err(PhaseError::EmptyInput);
    }
    ctx.user_input = input.to_string();

    let story_id = &ctx.story_id;
    let cancel = &ctx.cancel;
    let world = read(cancel, services.store.world_snapshot(story_id)).await?;
    let entries = read(cancel, services.store.knowledge_entries(story_id)).await?;
    let recent = read(
        cancel,
        services
            .chapters
            .recent_entries(story_id, ctx.config.retrieval.recent_window),
    )
    .await?;
    ctx.world = world;
    ctx.entries = entries;
    ctx.recent = recent;

    debug!(
        entries = ctx.entries.len(),
        recent = ctx.recent.len(),
        "Loaded turn inputs"
    );
    Ok(())
}

async fn read<T, F>(cancel: &CancellationToken, call: F) -> Result<T, PhaseError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PhaseError::Cancelled),
        result = call => Ok(result?),
    }
}
