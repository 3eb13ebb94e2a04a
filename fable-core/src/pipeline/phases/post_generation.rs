//! Refreshes next-action suggestions.

use super::classification::world_summary;
use super::{cancellable, profile, PhaseError};
use crate::capability::{CapabilityError, GenerationRequest};
use crate::pipeline::context::{Phase, PipelineContext};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::prompts::{PromptVars, TemplateId};
use crate::structured;
use crate::OutputSchema;
use serde::Deserialize;
use tracing::warn;

/// Suggestions kept per turn.
pub const MAX_SUGGESTIONS: usize = 3;

/// Actions the reader might take next.
#[derive(Debug, Deserialize, OutputSchema)]
#[schema(name = "suggestions")]
pub struct SuggestionList {
    /// Short first-person actions
    pub suggestions: Vec<String>,
}

pub async fn run(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PhaseError> {
    if !ctx.config.suggestions_enabled {
        return Ok(());
    }
    let profile = profile(&ctx.config.models.suggestions, Phase::PostGeneration, "a suggestions model")?;

    let vars = PromptVars::new()
        .with("world", world_summary(&ctx.world))
        .with("narrative", ctx.narrative.as_str());
    let system = services.renderer.render(TemplateId::Suggestions, &vars)?;
    let request = GenerationRequest::new(profile, system).with_user("Suggest what I could do next.");

    let result = cancellable(
        &ctx.cancel,
        structured::extract::<SuggestionList>(services.generator.as_ref(), request, &ctx.cancel),
    )
    .await;

    ctx.suggestions = match result {
        Ok(list) => list
            .suggestions
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(MAX_SUGGESTIONS)
            .collect(),
        Err(CapabilityError::Cancelled) => return Err(PhaseError::Cancelled),
        Err(e) => {
            warn!(error = %e, "Suggestion refresh failed");
            Vec::new()
        }
    };

    services.events.emit(PipelineEvent::SuggestionsReady {
        suggestions: ctx.suggestions.clone(),
    });
    Ok(())
}
