//! Per-turn working state.

use super::config::PipelineConfig;
use crate::context::ContextBundle;
use crate::entry::{KnowledgeEntry, StoryEntry, StoryId};
use crate::world::{StateDelta, WorldSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreGeneration,
    Retrieval,
    Narrative,
    Classification,
    Translation,
    Image,
    PostGeneration,
    Done,
}

impl Phase {
    /// Get the display name for this phase.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::PreGeneration => "pre_generation",
            Phase::Retrieval => "retrieval",
            Phase::Narrative => "narrative",
            Phase::Classification => "classification",
            Phase::Translation => "translation",
            Phase::Image => "image",
            Phase::PostGeneration => "post_generation",
            Phase::Done => "done",
        }
    }

    /// Whether this phase runs under `config`.
    pub fn is_enabled(&self, config: &PipelineConfig) -> bool {
        match self {
            Phase::Translation => config.translation.is_some(),
            Phase::Image => config.images.is_some(),
            _ => true,
        }
    }

    /// The phase that runs after this one, skipping disabled phases.
    pub fn next(&self, config: &PipelineConfig) -> Phase {
        let mut phase = self.successor();
        while !phase.is_enabled(config) {
            phase = phase.successor();
        }
        phase
    }

    /// The phase to run after `last_completed`; `None` means nothing ran yet.
    pub fn resume_point(last_completed: Option<Phase>, config: &PipelineConfig) -> Phase {
        match last_completed {
            Some(phase) => phase.next(config),
            None => Phase::PreGeneration,
        }
    }

    fn successor(&self) -> Phase {
        match self {
            Phase::PreGeneration => Phase::Retrieval,
            Phase::Retrieval => Phase::Narrative,
            Phase::Narrative => Phase::Classification,
            Phase::Classification => Phase::Translation,
            Phase::Translation => Phase::Image,
            Phase::Image => Phase::PostGeneration,
            Phase::PostGeneration | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An image request produced by scene planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedImage {
    pub scene_index: usize,
    pub prompt: String,
}

/// State threaded through every phase of one turn.
///
/// Serializable so it can be checkpointed; the cancellation token is
/// runtime-only and is re-attached on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub story_id: StoryId,
    pub turn_index: u32,
    pub user_input: String,
    /// Configuration snapshot taken when the turn started.
    pub config: PipelineConfig,
    pub phase: Phase,

    #[serde(default)]
    pub world: WorldSnapshot,
    /// Knowledge entries loaded for this turn only.
    #[serde(default)]
    pub entries: Vec<KnowledgeEntry>,
    /// Recent narrative history, oldest first.
    #[serde(default)]
    pub recent: Vec<StoryEntry>,
    #[serde(default)]
    pub bundle: ContextBundle,

    /// Narrative text streamed so far.
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub deltas: Vec<StateDelta>,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub image_queue: Vec<QueuedImage>,
    #[serde(default)]
    pub suggestions: Vec<String>,

    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        story_id: StoryId,
        turn_index: u32,
        user_input: impl Into<String>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            story_id,
            turn_index,
            user_input: user_input.into(),
            config,
            phase: Phase::PreGeneration,
            world: WorldSnapshot::default(),
            entries: Vec::new(),
            recent: Vec::new(),
            bundle: ContextBundle::default(),
            narrative: String::new(),
            deltas: Vec::new(),
            translation: None,
            image_queue: Vec::new(),
            suggestions: Vec::new(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
