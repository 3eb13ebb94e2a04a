//! Scene illustration.
//!
//! A planning call picks the scenes; each scene then becomes a detached
//! image task whose outcome is reported through the event sink. The phase
//! never waits for the images themselves.

use super::{cancellable, profile, PhaseError};
use crate::capability::{CapabilityError, EventSink, GenerationRequest, ImageGenerator};
use crate::pipeline::context::{Phase, PipelineContext, QueuedImage};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::prompts::{PromptVars, TemplateId};
use crate::structured;
use crate::OutputSchema;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One moment worth illustrating.
#[derive(Debug, Clone, Deserialize, OutputSchema)]
pub struct Scene {
    /// Self-contained image prompt
    pub prompt: String,
}

/// Scenes picked from one turn of narration.
#[derive(Debug, Deserialize, OutputSchema)]
#[schema(name = "scene_plan")]
pub struct ScenePlan {
    #[schema(nested)]
    pub scenes: Vec<Scene>,
}

pub async fn run(
    ctx: &mut PipelineContext,
    services: &PipelineServices,
    tasks: &Mutex<JoinSet<()>>,
) -> Result<(), PhaseError> {
    let Some(images) = ctx.config.images.clone() else {
        return Ok(());
    };
    let Some(generator) = services.images.clone() else {
        warn!("Image phase enabled without an image generator");
        return Ok(());
    };

    let scenes = match plan_scenes(ctx, services, images.max_scenes).await {
        Ok(scenes) => scenes,
        Err(CapabilityError::Cancelled) => return Err(PhaseError::Cancelled),
        Err(e) => {
            warn!(error = %e, "Scene planning failed, no images this turn");
            Vec::new()
        }
    };

    let mut tasks = tasks.lock().await;
    let reaped = reap_finished(&mut tasks);
    if reaped > 0 {
        debug!(reaped, "Collected finished image tasks");
    }
    for (scene_index, scene) in scenes.into_iter().enumerate() {
        let queued = QueuedImage {
            scene_index,
            prompt: scene.prompt,
        };
        services.events.emit(PipelineEvent::ImageQueued {
            scene_index,
            prompt: queued.prompt.clone(),
        });
        tasks.spawn(generate(
            generator.clone(),
            services.events.clone(),
            queued.clone(),
            ctx.cancel.clone(),
        ));
        ctx.image_queue.push(queued);
    }

    info!(queued = ctx.image_queue.len(), "Images queued");
    Ok(())
}

/// Remove tasks that already finished; returns how many were removed.
pub(crate) fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Image task did not finish");
        }
        reaped += 1;
    }
    reaped
}

async fn plan_scenes(
    ctx: &PipelineContext,
    services: &PipelineServices,
    max_scenes: usize,
) -> Result<Vec<Scene>, CapabilityError> {
    if max_scenes == 0 {
        return Ok(Vec::new());
    }
    let profile = profile(&ctx.config.models.scene_planning, Phase::Image, "a scene planning model")
        .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
    let vars = PromptVars::new()
        .with("narrative", ctx.narrative.as_str())
        .with("max_scenes", max_scenes.to_string());
    let system = services
        .renderer
        .render(TemplateId::ScenePlanning, &vars)
        .map_err(|e| CapabilityError::Rejected(e.to_string()))?;
    let request = GenerationRequest::new(profile, system).with_user("Pick the scenes to illustrate.");

    let plan: ScenePlan = cancellable(
        &ctx.cancel,
        structured::extract(services.generator.as_ref(), request, &ctx.cancel),
    )
    .await?;

    Ok(plan
        .scenes
        .into_iter()
        .filter(|scene| !scene.prompt.trim().is_empty())
        .take(max_scenes)
        .collect())
}

async fn generate(
    generator: Arc<dyn ImageGenerator>,
    events: Arc<dyn EventSink>,
    queued: QueuedImage,
    cancel: CancellationToken,
) {
    let scene_index = queued.scene_index;
    match cancellable(&cancel, generator.generate_image(&queued.prompt, &cancel)).await {
        Ok(artifact) => {
            debug!(scene_index, uri = %artifact.uri, "Image ready");
            events.emit(PipelineEvent::ImageReady { scene_index, artifact });
        }
        Err(e) => {
            warn!(scene_index, error = %e, "Image generation failed");
            events.emit(PipelineEvent::ImageFailed {
                scene_index,
                error: e.to_string(),
            });
        }
    }
}
