//! Testing utilities for the pipeline.
//!
//! This module provides deterministic stand-ins for every external
//! capability:
//! - `ScriptedGenerator` for text generation without API calls
//! - `MockImageGenerator`, `MemoryStoryStore` and `RecordingSink`
//! - `TestHarness` wiring them into a `GenerationPipeline`
//! - Assertion helpers for verifying event streams

use crate::capability::{
    CapabilityError, ChapterEntryLookup, EventSink, GenerationProfile, GenerationRequest,
    ImageArtifact, ImageGenerator, StoreError, StoryStore, TextGenerator, TokenStream,
};
use crate::entry::{KnowledgeEntry, StoryEntry, StoryId};
use crate::pipeline::{GenerationPipeline, Phase, PipelineConfig, PipelineEvent, PipelineServices};
use crate::retry::MemoryCheckpointStore;
use crate::world::{StateDelta, WorldSnapshot};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Substrings identifying the built-in templates in a system prompt.
pub const CLASSIFICATION_PROMPT: &str = "extracting world-state changes";
pub const RERANK_PROMPT: &str = "choosing which background knowledge";
pub const TRANSLATION_PROMPT: &str = "Translate the following passage";
pub const SCENE_PROMPT: &str = "picking moments";
pub const SUGGESTIONS_PROMPT: &str = "suggesting what the reader";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not take every other assertion down with it
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pop the next scripted item, keeping the last one for every later call.
fn next_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// One scripted narrative stream.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Opening the stream fails.
    OpenError(CapabilityError),
    /// The stream yields these items, then ends.
    Items(Vec<Result<String, CapabilityError>>),
    /// The stream yields these chunks, then never ends.
    Stall(Vec<String>),
}

impl StreamScript {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamScript::Items(chunks.into_iter().map(|c| Ok(c.into())).collect())
    }
}

/// A text generator that replays scripted replies.
///
/// Replies registered with [`respond_when`](Self::respond_when) are picked
/// by a substring of the system prompt; everything else comes from the
/// FIFO queue filled by [`push_reply`](Self::push_reply). In both cases the
/// last scripted reply is repeated once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    rules: Mutex<Vec<(String, VecDeque<Result<String, CapabilityError>>)>>,
    replies: Mutex<VecDeque<Result<String, CapabilityError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<GenerationRequest>>,
    stream_calls: Mutex<usize>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` when the system prompt contains `needle`.
    pub fn respond_when(&self, needle: impl Into<String>, reply: impl Into<String>) {
        self.add_rule(needle.into(), Ok(reply.into()));
    }

    /// Fail with `error` when the system prompt contains `needle`.
    pub fn fail_when(&self, needle: impl Into<String>, error: CapabilityError) {
        self.add_rule(needle.into(), Err(error));
    }

    /// Drop any replies scripted for `needle` and reply with `reply` instead.
    pub fn replace_when(&self, needle: impl Into<String>, reply: impl Into<String>) {
        let needle = needle.into();
        lock(&self.rules).retain(|(n, _)| *n != needle);
        self.add_rule(needle, Ok(reply.into()));
    }

    fn add_rule(&self, needle: String, reply: Result<String, CapabilityError>) {
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|(n, _)| *n == needle) {
            Some((_, replies)) => replies.push_back(reply),
            None => rules.push((needle, VecDeque::from([reply]))),
        }
    }

    /// Queue a reply for requests no rule matches.
    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    /// Queue a narrative stream.
    pub fn push_stream(&self, script: StreamScript) {
        lock(&self.streams).push_back(script);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    /// Requests whose system prompt contains `needle`.
    pub fn requests_matching(&self, needle: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.system.contains(needle))
            .count()
    }

    pub fn stream_calls(&self) -> usize {
        *lock(&self.stream_calls)
    }

    fn reply_for(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        let mut rules = lock(&self.rules);
        if let Some((_, replies)) = rules
            .iter_mut()
            .find(|(needle, _)| request.system.contains(needle.as_str()))
        {
            if let Some(reply) = next_sticky(replies) {
                return reply;
            }
        }
        drop(rules);

        next_sticky(&mut lock(&self.replies))
            .unwrap_or_else(|| Err(CapabilityError::Unavailable("no scripted reply".to_string())))
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        let reply = self.reply_for(&request);
        lock(&self.requests).push(request);
        reply
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<TokenStream, CapabilityError> {
        lock(&self.requests).push(request);
        *lock(&self.stream_calls) += 1;

        let script = next_sticky(&mut lock(&self.streams))
            .ok_or_else(|| CapabilityError::Unavailable("no scripted stream".to_string()))?;

        match script {
            StreamScript::OpenError(error) => Err(error),
            StreamScript::Items(items) => Ok(Box::pin(tokio_stream::iter(items))),
            StreamScript::Stall(chunks) => {
                let head = tokio_stream::iter(chunks.into_iter().map(Ok));
                let tail = tokio_stream::pending::<Result<String, CapabilityError>>();
                Ok(Box::pin(tokio_stream::StreamExt::chain(head, tail)))
            }
        }
    }
}

/// An image generator that succeeds (or fails) instantly.
#[derive(Debug, Default)]
pub struct MockImageGenerator {
    prompts: Mutex<Vec<String>>,
    failure: Option<CapabilityError>,
}

impl MockImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator whose every call fails with `error`.
    pub fn failing(error: CapabilityError) -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate_image(
        &self,
        prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ImageArtifact, CapabilityError> {
        let index = {
            let mut prompts = lock(&self.prompts);
            prompts.push(prompt.to_string());
            prompts.len()
        };
        match self.failure {
            Some(ref error) => Err(error.clone()),
            None => Ok(ImageArtifact {
                uri: format!("mock://image/{index}"),
                mime_type: Some("image/png".to_string()),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct StoryState {
    entries: Vec<KnowledgeEntry>,
    world: WorldSnapshot,
    history: Vec<StoryEntry>,
    updates: Vec<Vec<StateDelta>>,
}

/// An in-memory story store holding a single story.
#[derive(Debug, Default)]
pub struct MemoryStoryStore {
    state: Mutex<StoryState>,
    fail_writes: Mutex<bool>,
}

impl MemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, entry: KnowledgeEntry) {
        lock(&self.state).entries.push(entry);
    }

    pub fn set_world(&self, world: WorldSnapshot) {
        lock(&self.state).world = world;
    }

    pub fn push_history(&self, entry: StoryEntry) {
        lock(&self.state).history.push(entry);
    }

    /// Make every write fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    pub fn world(&self) -> WorldSnapshot {
        lock(&self.state).world.clone()
    }

    pub fn history(&self) -> Vec<StoryEntry> {
        lock(&self.state).history.clone()
    }

    /// Every world update received, in order.
    pub fn updates(&self) -> Vec<Vec<StateDelta>> {
        lock(&self.state).updates.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if *lock(&self.fail_writes) {
            return Err(StoreError::Backend("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn knowledge_entries(&self, _story_id: &StoryId) -> Result<Vec<KnowledgeEntry>, StoreError> {
        Ok(lock(&self.state).entries.clone())
    }

    async fn world_snapshot(&self, _story_id: &StoryId) -> Result<WorldSnapshot, StoreError> {
        Ok(lock(&self.state).world.clone())
    }

    async fn apply_world_update(&self, _story_id: &StoryId, deltas: &[StateDelta]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        state.world.apply_all(deltas);
        state.updates.push(deltas.to_vec());
        Ok(())
    }

    async fn append_story_entries(&self, _story_id: &StoryId, entries: &[StoryEntry]) -> Result<(), StoreError> {
        self.check_writable()?;
        lock(&self.state).history.extend_from_slice(entries);
        Ok(())
    }
}

#[async_trait]
impl ChapterEntryLookup for MemoryStoryStore {
    async fn recent_entries(&self, _story_id: &StoryId, limit: usize) -> Result<Vec<StoryEntry>, StoreError> {
        let state = lock(&self.state);
        let start = state.history.len().saturating_sub(limit);
        Ok(state.history[start..].to_vec())
    }
}

/// When a [`RecordingSink`] cancels the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTrigger {
    /// Right after the n-th narrative chunk.
    Chunks(usize),
    /// Right after `PhaseComplete` for the phase.
    PhaseComplete(Phase),
}

/// An event sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
    cancel_on: Mutex<Option<(CancelTrigger, CancellationToken)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` when `trigger` is reached.
    pub fn cancel_on(&self, trigger: CancelTrigger, token: CancellationToken) {
        *lock(&self.cancel_on) = Some((trigger, token));
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// Concatenated narrative chunks.
    pub fn narrative(&self) -> String {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::NarrativeChunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Phases that emitted `PhaseStart`, in order.
    pub fn started_phases(&self) -> Vec<Phase> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::PhaseStart { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(*e)).count()
    }

    pub fn last(&self) -> Option<PipelineEvent> {
        lock(&self.events).last().cloned()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        let mut events = lock(&self.events);
        let fire = match *lock(&self.cancel_on) {
            Some((CancelTrigger::Chunks(limit), ref token)) => {
                let chunks = events
                    .iter()
                    .filter(|e| matches!(e, PipelineEvent::NarrativeChunk { .. }))
                    .count();
                let is_chunk = matches!(event, PipelineEvent::NarrativeChunk { .. });
                (is_chunk && chunks + 1 == limit).then(|| token.clone())
            }
            Some((CancelTrigger::PhaseComplete(phase), ref token)) => {
                matches!(event, PipelineEvent::PhaseComplete { phase: p } if p == phase)
                    .then(|| token.clone())
            }
            None => None,
        };
        events.push(event);

        if let Some(token) = fire {
            token.cancel();
        }
    }
}

/// Mocks wired into pipeline services.
pub struct TestHarness {
    pub generator: Arc<ScriptedGenerator>,
    pub images: Arc<MockImageGenerator>,
    pub store: Arc<MemoryStoryStore>,
    pub sink: Arc<RecordingSink>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl TestHarness {
    /// Create a harness with empty scripts.
    pub fn new() -> Self {
        Self {
            generator: Arc::new(ScriptedGenerator::new()),
            images: Arc::new(MockImageGenerator::new()),
            store: Arc::new(MemoryStoryStore::new()),
            sink: Arc::new(RecordingSink::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    /// Create a harness scripted for a quiet, successful turn.
    pub fn scripted(narrative: &[&str]) -> Self {
        let harness = Self::new();
        harness.generator.push_stream(StreamScript::chunks(narrative.iter().copied()));
        harness.generator.respond_when(CLASSIFICATION_PROMPT, r#"{"deltas": []}"#);
        harness.generator.respond_when(RERANK_PROMPT, r#"{"selected": []}"#);
        harness
            .generator
            .respond_when(SUGGESTIONS_PROMPT, r#"{"suggestions": ["I wait", "I leave"]}"#);
        harness.generator.respond_when(SCENE_PROMPT, r#"{"scenes": []}"#);
        harness
    }

    pub fn services(&self) -> PipelineServices {
        PipelineServices::new(
            self.generator.clone(),
            self.store.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.checkpoints.clone(),
        )
        .with_images(self.images.clone())
    }

    pub fn pipeline(&self, story_id: &str) -> GenerationPipeline {
        GenerationPipeline::new(story_id.into(), self.services())
    }

    /// A valid config using one mock model for every step.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::with_single_model(GenerationProfile::new("mock"))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that exactly one terminal event was emitted, and that it is `Done`.
#[track_caller]
pub fn assert_done(sink: &RecordingSink) {
    let terminal: Vec<PipelineEvent> = sink.events().into_iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "Expected one terminal event, got {terminal:?}");
    assert!(
        matches!(terminal[0], PipelineEvent::Done { .. }),
        "Expected Done, got {:?}",
        terminal[0]
    );
}

/// Assert the phases that started, in order.
#[track_caller]
pub fn assert_phases(sink: &RecordingSink, expected: &[Phase]) {
    assert_eq!(sink.started_phases(), expected, "Unexpected phase sequence");
}
