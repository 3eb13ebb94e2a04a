//! Extracts world-state changes from the narrative.
//!
//! The reader already has the narrative, so nothing here is fatal except
//! cancellation: any failure degrades to "no world update this turn".

use super::{cancellable, profile, PhaseError};
use crate::capability::{CapabilityError, GenerationRequest};
use crate::pipeline::context::{Phase, PipelineContext};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::prompts::{PromptVars, TemplateId};
use crate::structured;
use crate::world::{StateDelta, WorldSnapshot};
use crate::OutputSchema;
use serde::Deserialize;
use tracing::{info, warn};

/// World-state changes made explicit by one turn of narration.
#[derive(Debug, Deserialize, OutputSchema)]
#[schema(name = "classification")]
pub struct ClassificationOutput {
    /// Changes in the order they happened
    pub deltas: Vec<StateDelta>,
}

pub async fn run(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PhaseError> {
    let profile = profile(
        &ctx.config.models.classification,
        Phase::Classification,
        "a classification model",
    )?;
    let vars = PromptVars::new()
        .with("world", world_summary(&ctx.world))
        .with("user_input", ctx.user_input.as_str())
        .with("narrative", ctx.narrative.as_str());
    let system = services.renderer.render(TemplateId::Classification, &vars)?;
    let request = GenerationRequest::new(profile, system).with_user("Extract the world-state changes.");

    let mut outcome = extract(ctx, services, request.clone()).await;
    if matches!(outcome, Err(ref e) if e.is_transient()) {
        warn!("Classification failed transiently, retrying once");
        outcome = extract(ctx, services, request).await;
    }

    let (deltas, degraded) = match outcome {
        Ok(output) => (output.deltas, None),
        Err(CapabilityError::Cancelled) => return Err(PhaseError::Cancelled),
        Err(e) => {
            warn!(error = %e, "Classification degraded to no world update");
            (Vec::new(), Some(e.to_string()))
        }
    };

    if !deltas.is_empty() {
        let changed = ctx.world.apply_all(&deltas);
        info!(deltas = deltas.len(), changed, "World state updated");
        if let Err(e) = services.store.apply_world_update(&ctx.story_id, &deltas).await {
            warn!(error = %e, "Failed to persist world update");
        }
    }

    ctx.deltas = deltas.clone();
    services
        .events
        .emit(PipelineEvent::ClassificationComplete { deltas, degraded });
    Ok(())
}

async fn extract(
    ctx: &PipelineContext,
    services: &PipelineServices,
    request: GenerationRequest,
) -> Result<ClassificationOutput, CapabilityError> {
    cancellable(
        &ctx.cancel,
        structured::extract::<ClassificationOutput>(services.generator.as_ref(), request, &ctx.cancel),
    )
    .await
}

pub(crate) fn world_summary(world: &WorldSnapshot) -> String {
    let lines = world.fact_lines();
    if lines.is_empty() {
        "(nothing recorded)".to_string()
    } else {
        lines.join("\n")
    }
}
