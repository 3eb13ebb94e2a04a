//! The generation pipeline.
//!
//! One `GenerationPipeline` serves one story. Turns run the phases in a
//! fixed order, skipping disabled ones:
//!
//! ```text
//! PreGeneration -> Retrieval -> Narrative -> Classification
//!     -> [Translation] -> [Image] -> PostGeneration -> Done
//! ```
//!
//! Cancellation stops the turn between or inside phases and yields
//! [`TurnOutcome::Aborted`] with whatever was produced so far. An
//! unrecoverable phase error yields [`TurnOutcome::Failed`] and keeps the
//! checkpoint so the turn can be resumed with [`GenerationPipeline::resume`].
//! Writes already committed by earlier phases are never rolled back.

pub mod config;
pub mod context;
pub mod events;
pub mod phases;

pub use config::{ConfigError, ImageConfig, PhaseModels, PipelineConfig, TranslationConfig};
pub use context::{Phase, PipelineContext, QueuedImage};
pub use events::PipelineEvent;
pub use phases::PhaseError;

use crate::capability::{
    ChapterEntryLookup, EventSink, ImageGenerator, PromptRenderer, StoreError, StoryStore,
    TextGenerator,
};
use crate::entry::StoryId;
use crate::prompts::TemplateRenderer;
use crate::retrieval::ActivationTracker;
use crate::retry::{CheckpointStore, RestoredTurn, RetryService};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// The external capabilities a pipeline runs against.
#[derive(Clone)]
pub struct PipelineServices {
    pub generator: Arc<dyn TextGenerator>,
    pub images: Option<Arc<dyn ImageGenerator>>,
    pub store: Arc<dyn StoryStore>,
    pub chapters: Arc<dyn ChapterEntryLookup>,
    pub renderer: Arc<dyn PromptRenderer>,
    pub events: Arc<dyn EventSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl PipelineServices {
    /// Create services with the built-in prompt templates and no image
    /// generator.
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn StoryStore>,
        chapters: Arc<dyn ChapterEntryLookup>,
        events: Arc<dyn EventSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            generator,
            images: None,
            store,
            chapters,
            renderer: Arc::new(TemplateRenderer::new()),
            events,
            checkpoints,
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn without_images(mut self) -> Self {
        self.images = None;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed(Box<PipelineContext>),
    Aborted {
        phase: Phase,
        context: Box<PipelineContext>,
    },
    Failed {
        phase: Phase,
        error: PhaseError,
        context: Box<PipelineContext>,
    },
}

impl TurnOutcome {
    pub fn context(&self) -> &PipelineContext {
        match self {
            TurnOutcome::Completed(context)
            | TurnOutcome::Aborted { context, .. }
            | TurnOutcome::Failed { context, .. } => context,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed(_))
    }
}

/// Sequences the phases for one story.
///
/// Turns of the same story must not overlap; the caller serializes them.
/// Image tasks outlive their turn; call [`drain_images`](Self::drain_images)
/// before dropping the pipeline to let them finish.
pub struct GenerationPipeline {
    story_id: StoryId,
    services: PipelineServices,
    retry: RetryService,
    tracker: Mutex<ActivationTracker>,
    images: Mutex<JoinSet<()>>,
}

impl GenerationPipeline {
    pub fn new(story_id: StoryId, services: PipelineServices) -> Self {
        let retry = RetryService::new(services.checkpoints.clone());
        Self {
            story_id,
            services,
            retry,
            tracker: Mutex::new(ActivationTracker::default()),
            images: Mutex::new(JoinSet::new()),
        }
    }

    pub fn story_id(&self) -> &StoryId {
        &self.story_id
    }

    /// The checkpoint service, e.g. to look for a turn to resume.
    pub fn retry(&self) -> &RetryService {
        &self.retry
    }

    /// Run a new turn from the start.
    ///
    /// Configuration problems are reported before any external call.
    pub async fn run(
        &self,
        turn_index: u32,
        user_input: &str,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, ConfigError> {
        config.validate(&self.services)?;

        let ctx = PipelineContext::new(self.story_id.clone(), turn_index, user_input, config, cancel);
        if let Err(e) = self.retry.save(&ctx, None).await {
            warn!(story_id = %self.story_id, error = %e, "Failed to create checkpoint");
        }
        Ok(self.drive(ctx, None).await)
    }

    /// Continue a restored turn from the phase after its last completed one.
    pub async fn resume(&self, restored: RestoredTurn, cancel: CancellationToken) -> Result<TurnOutcome, ConfigError> {
        restored.context.config.validate(&self.services)?;

        let mut ctx = restored.context;
        ctx.cancel = cancel;
        info!(
            story_id = %self.story_id,
            turn = ctx.turn_index,
            last_completed = ?restored.last_completed,
            "Resuming turn"
        );
        Ok(self.drive(ctx, restored.last_completed).await)
    }

    /// Wait for every outstanding image task.
    pub async fn drain_images(&self) {
        let mut tasks = self.images.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Image task did not finish");
            }
        }
    }

    /// Number of image tasks still running.
    pub async fn pending_images(&self) -> usize {
        self.images.lock().await.len()
    }

    async fn drive(&self, mut ctx: PipelineContext, mut last_completed: Option<Phase>) -> TurnOutcome {
        let events = &self.services.events;
        let mut phase = Phase::resume_point(last_completed, &ctx.config);

        loop {
            if phase == Phase::Done {
                ctx.phase = Phase::Done;
                if let Err(e) = self.retry.discard(&ctx.story_id).await {
                    warn!(story_id = %ctx.story_id, error = %e, "Failed to delete checkpoint");
                }
                info!(story_id = %ctx.story_id, turn = ctx.turn_index, "Turn complete");
                events.emit(PipelineEvent::Done {
                    context: Box::new(ctx.clone()),
                });
                return TurnOutcome::Completed(Box::new(ctx));
            }

            ctx.phase = phase;
            if ctx.is_cancelled() {
                return self.abort(phase, ctx);
            }

            if phase == Phase::Narrative {
                if let Err(e) = self.retry.save(&ctx, last_completed).await {
                    return self.fail(phase, PhaseError::Checkpoint(e), ctx);
                }
            }

            events.emit(PipelineEvent::PhaseStart { phase });
            let span = info_span!("phase", phase = %phase, story_id = %ctx.story_id);
            let result = self.run_phase(phase, &mut ctx).instrument(span).await;

            match result {
                Ok(()) => {
                    events.emit(PipelineEvent::PhaseComplete { phase });
                    last_completed = Some(phase);
                    let next = phase.next(&ctx.config);
                    if phase == Phase::Narrative {
                        // Resuming from an older checkpoint would stream and record the narrative again
                        if let Err(e) = self.save_after_narrative(&ctx).await {
                            return self.fail(phase, PhaseError::Checkpoint(e), ctx);
                        }
                    } else if next != Phase::Done && next != Phase::Narrative {
                        if let Err(e) = self.retry.save(&ctx, last_completed).await {
                            warn!(phase = %phase, error = %e, "Failed to update checkpoint");
                        }
                    }
                    phase = next;
                }
                Err(e) if e.is_cancellation() => return self.abort(phase, ctx),
                Err(e) => return self.fail(phase, e, ctx),
            }
        }
    }

    /// Record the finished narrative, trying the write twice.
    async fn save_after_narrative(&self, ctx: &PipelineContext) -> Result<(), StoreError> {
        match self.retry.save(ctx, Some(Phase::Narrative)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(story_id = %ctx.story_id, error = %e, "Checkpoint after narrative failed, retrying");
                self.retry.save(ctx, Some(Phase::Narrative)).await
            }
        }
    }

    async fn run_phase(&self, phase: Phase, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        let services = &self.services;
        match phase {
            Phase::PreGeneration => phases::pre_generation::run(ctx, services).await,
            Phase::Retrieval => phases::retrieval::run(ctx, services, &self.tracker).await,
            Phase::Narrative => phases::narrative::run(ctx, services).await,
            Phase::Classification => phases::classification::run(ctx, services).await,
            Phase::Translation => phases::translation::run(ctx, services).await,
            Phase::Image => phases::image::run(ctx, services, &self.images).await,
            Phase::PostGeneration => phases::post_generation::run(ctx, services).await,
            Phase::Done => Ok(()),
        }
    }

    fn abort(&self, phase: Phase, ctx: PipelineContext) -> TurnOutcome {
        info!(story_id = %ctx.story_id, phase = %phase, "Turn aborted");
        self.services.events.emit(PipelineEvent::Aborted {
            phase,
            context: Box::new(ctx.clone()),
        });
        TurnOutcome::Aborted {
            phase,
            context: Box::new(ctx),
        }
    }

    fn fail(&self, phase: Phase, error: PhaseError, ctx: PipelineContext) -> TurnOutcome {
        error!(story_id = %ctx.story_id, phase = %phase, error = %error, "Phase failed");
        self.services.events.emit(PipelineEvent::Error {
            phase,
            cause: error.to_string(),
            context: Box::new(ctx.clone()),
        });
        TurnOutcome::Failed {
            phase,
            error,
            context: Box::new(ctx),
        }
    }
}
