//! Streams the narrative continuation.
//!
//! Chunks are appended to the context and emitted in generation order. A
//! transient failure before the first chunk is retried once; after text
//! has reached the reader a failure is final. The narrative timeout
//! covers the whole phase and is fatal.

use super::{profile, PhaseError};
use crate::capability::{CapabilityError, ChatMessage, GenerationRequest};
use crate::entry::{StoryEntry, StoryEntryKind};
use crate::pipeline::context::{Phase, PipelineContext};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::PipelineServices;
use crate::prompts::{PromptVars, TemplateId};
use futures::StreamExt;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

const NO_CONTEXT: &str = "(nothing established yet)";

/// Why a streaming attempt ended early.
enum StreamFailure {
    Cancelled,
    TimedOut,
    Capability { error: CapabilityError, received_text: bool },
}

pub async fn run(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PhaseError> {
    let request = build_request(ctx, services)?;
    let timeout = ctx.config.narrative_timeout();
    let deadline = Instant::now() + timeout;

    ctx.narrative.clear();
    let mut retried = false;
    loop {
        match stream_once(ctx, services, request.clone(), deadline).await {
            Ok(()) => break,
            Err(StreamFailure::Cancelled) => return Err(PhaseError::Cancelled),
            Err(StreamFailure::TimedOut) => return Err(PhaseError::NarrativeTimeout(timeout)),
            Err(StreamFailure::Capability { error, received_text }) => {
                if error.is_transient() && !received_text && !retried {
                    warn!(error = %error, "Narrative stream failed before any text, retrying once");
                    retried = true;
                    continue;
                }
                return Err(error.into());
            }
        }
    }

    if ctx.narrative.trim().is_empty() {
        return Err(PhaseError::EmptyNarrative);
    }
    info!(chars = ctx.narrative.chars().count(), "Narrative complete");

    let history = [
        StoryEntry::user_action(ctx.user_input.clone()),
        StoryEntry::narration(ctx.narrative.clone()),
    ];
    // The reader already has the text; a failed history write must not cost them the turn
    if let Err(e) = services.store.append_story_entries(&ctx.story_id, &history).await {
        warn!(error = %e, "Failed to append narrative to story history");
    }
    Ok(())
}

fn build_request(ctx: &PipelineContext, services: &PipelineServices) -> Result<GenerationRequest, PhaseError> {
    let profile = profile(&ctx.config.models.narrative, Phase::Narrative, "a narrative model")?;

    let context = if ctx.bundle.rendered.is_empty() {
        NO_CONTEXT
    } else {
        ctx.bundle.rendered.as_str()
    };
    let system = services
        .renderer
        .render(TemplateId::NarrativeSystem, &PromptVars::new().with("context", context))?;

    let mut messages: Vec<ChatMessage> = ctx
        .recent
        .iter()
        .map(|entry| match entry.kind {
            StoryEntryKind::UserAction => ChatMessage::user(entry.content.clone()),
            StoryEntryKind::Narration => ChatMessage::assistant(entry.content.clone()),
        })
        .collect();
    messages.push(ChatMessage::user(ctx.user_input.clone()));

    Ok(GenerationRequest::new(profile, system).with_messages(messages))
}

async fn stream_once(
    ctx: &mut PipelineContext,
    services: &PipelineServices,
    request: GenerationRequest,
    deadline: Instant,
) -> Result<(), StreamFailure> {
    let cancel = ctx.cancel.clone();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StreamFailure::Cancelled),
        _ = sleep_until(deadline) => return Err(StreamFailure::TimedOut),
        opened = services.generator.stream(request, &cancel) => opened,
    };
    let mut stream = opened.map_err(|error| capability_failure(error, false))?;

    let mut received_text = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamFailure::Cancelled),
            _ = sleep_until(deadline) => return Err(StreamFailure::TimedOut),
            next = stream.next() => next,
        };

        match next {
            None => return Ok(()),
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                received_text = true;
                ctx.narrative.push_str(&chunk);
                services.events.emit(PipelineEvent::NarrativeChunk { text: chunk });
            }
            Some(Err(error)) => return Err(capability_failure(error, received_text)),
        }
    }
}

fn capability_failure(error: CapabilityError, received_text: bool) -> StreamFailure {
    match error {
        CapabilityError::Cancelled => StreamFailure::Cancelled,
        error => StreamFailure::Capability { error, received_text },
    }
}
