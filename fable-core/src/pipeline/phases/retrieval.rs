//! Selects knowledge entries and builds the context bundle.

use super::PhaseError;
use crate::context::ContextBuilder;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::PipelineServices;
use crate::retrieval::{ActivationTracker, EntryReranker, EntryRetrievalEngine, LlmReranker, ScoreContext};
use tokio::sync::Mutex;
use tracing::info;

pub async fn run(
    ctx: &mut PipelineContext,
    services: &PipelineServices,
    tracker: &Mutex<ActivationTracker>,
) -> Result<(), PhaseError> {
    let config = &ctx.config;
    let engine = EntryRetrievalEngine::new(config.retrieval.clone());

    let reranker = match (config.retrieval.llm_selection, &config.models.rerank) {
        (true, Some(profile)) => Some(LlmReranker::new(
            services.generator.clone(),
            services.renderer.clone(),
            profile.clone(),
        )),
        _ => None,
    };

    let score_ctx = ScoreContext::new(
        &ctx.user_input,
        ctx.recent.iter().map(|e| e.content.as_str()),
        ctx.world.live_names(),
    );

    let mut tracker = tracker.lock().await;
    tracker.set_sticky_threshold(config.retrieval.sticky_threshold);
    let retrieved = engine
        .retrieve(
            &ctx.entries,
            &score_ctx,
            &mut tracker,
            ctx.turn_index,
            reranker.as_ref().map(|r| r as &dyn EntryReranker),
            &ctx.cancel,
        )
        .await;

    if ctx.cancel.is_cancelled() {
        return Err(PhaseError::Cancelled);
    }

    let bundle = ContextBuilder::new(config.context.clone()).build(&ctx.world, &retrieved)?;
    engine.activate_selected(&retrieved, &mut tracker, ctx.turn_index);
    drop(tracker);

    info!(
        tier1 = bundle.tier1.len(),
        tier2 = bundle.tier2.len(),
        tier3 = bundle.tier3.len(),
        trimmed = bundle.trimmed,
        chars = bundle.rendered.chars().count(),
        "Context assembled"
    );
    ctx.bundle = bundle;
    Ok(())
}
