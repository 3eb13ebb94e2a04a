//! Events emitted to the UI layer.

use super::context::{Phase, PipelineContext};
use crate::capability::ImageArtifact;
use crate::world::StateDelta;
use serde::Serialize;

/// A typed pipeline event.
///
/// Terminal events (`Error`, `Aborted`, `Done`) carry the context as it
/// stood when the turn stopped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseStart {
        phase: Phase,
    },
    PhaseComplete {
        phase: Phase,
    },
    /// One streamed piece of narrative, in generation order.
    NarrativeChunk {
        text: String,
    },
    ClassificationComplete {
        deltas: Vec<StateDelta>,
        /// Why extraction degraded to no updates, if it did.
        degraded: Option<String>,
    },
    TranslationComplete {
        language: String,
        text: String,
    },
    ImageQueued {
        scene_index: usize,
        prompt: String,
    },
    ImageReady {
        scene_index: usize,
        artifact: ImageArtifact,
    },
    ImageFailed {
        scene_index: usize,
        error: String,
    },
    SuggestionsReady {
        suggestions: Vec<String>,
    },
    Error {
        phase: Phase,
        cause: String,
        context: Box<PipelineContext>,
    },
    Aborted {
        phase: Phase,
        context: Box<PipelineContext>,
    },
    Done {
        context: Box<PipelineContext>,
    },
}

impl PipelineEvent {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Error { .. } | PipelineEvent::Aborted { .. } | PipelineEvent::Done { .. }
        )
    }
}
