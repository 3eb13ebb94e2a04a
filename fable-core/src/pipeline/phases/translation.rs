//! Optional translation of the narrative.

use super::{cancellable, profile, PhaseError};
use crate::capability::{CapabilityError, GenerationRequest};
use crate::pipeline::context::{Phase, PipelineContext};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::prompts::{PromptVars, TemplateId};
use tracing::{debug, warn};

/// Translate `ctx.narrative` into the configured language. Failures leave
/// the turn untranslated.
pub async fn run(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PhaseError> {
    let Some(translation) = ctx.config.translation.clone() else {
        return Ok(());
    };
    let profile = profile(&ctx.config.models.translation, Phase::Translation, "a translation model")?;

    let vars = PromptVars::new()
        .with("target_language", translation.target_language.as_str())
        .with("text", ctx.narrative.as_str());
    let system = services.renderer.render(TemplateId::Translation, &vars)?;
    let request = GenerationRequest::new(profile, system).with_user("Translate the passage.");

    let result = cancellable(&ctx.cancel, services.generator.generate(request, &ctx.cancel)).await;
    match result {
        Ok(text) if !text.trim().is_empty() => {
            let text = text.trim().to_string();
            debug!(language = %translation.target_language, chars = text.chars().count(), "Narrative translated");
            ctx.translation = Some(text.clone());
            services.events.emit(PipelineEvent::TranslationComplete {
                language: translation.target_language,
                text,
            });
        }
        Ok(_) => warn!("Translation came back empty"),
        Err(CapabilityError::Cancelled) => return Err(PhaseError::Cancelled),
        Err(e) => warn!(error = %e, "Translation failed, continuing untranslated"),
    }
    Ok(())
}
