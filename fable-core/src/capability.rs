//! External capabilities the core consumes.
//!
//! Model inference, image generation, storage, prompt rendering and event
//! delivery are all provided by the host application. The core only sees
//! these traits, so any provider can sit behind them.

use crate::entry::{KnowledgeEntry, StoryEntry, StoryId};
use crate::pipeline::events::PipelineEvent;
use crate::prompts::{PromptVars, TemplateId};
use crate::structured;
use crate::world::{StateDelta, WorldSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by an external capability call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl CapabilityError {
    /// Network and timeout failures, the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_) | CapabilityError::Timeout(_))
    }
}

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Story not found: {0}")]
    NotFound(StoryId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors from prompt rendering.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown template: {0:?}")]
    UnknownTemplate(TemplateId),

    #[error("Missing template variable '{variable}' in {template:?}")]
    MissingVariable {
        template: TemplateId,
        variable: String,
    },
}

/// How hard a reasoning model should think.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Generation parameters for one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProfile {
    pub model: String,
    pub max_tokens: usize,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl GenerationProfile {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 1024,
            temperature: None,
            reasoning_effort: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single text-generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub profile: GenerationProfile,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// When set, the reply must be a JSON value matching this schema.
    pub response_schema: Option<serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(profile: GenerationProfile, system: impl Into<String>) -> Self {
        Self {
            profile,
            system: system.into(),
            messages: Vec::new(),
            response_schema: None,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Streamed narrative tokens, delivered in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, CapabilityError>> + Send>>;

/// Text generation backed by a language model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a complete reply.
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError>;

    /// Generate a reply as a token stream.
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, CapabilityError>;

    /// Generate a reply constrained to `request.response_schema`.
    ///
    /// The default implementation asks for plain text and parses the first
    /// JSON value out of it; providers with native structured output should
    /// override this.
    async fn generate_structured(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        let text = self.generate(request, cancel).await?;
        structured::parse_json_value(&text)
    }
}

/// A generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Where the host stored the image.
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Image generation.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageArtifact, CapabilityError>;
}

/// Read/write access to the persistent story store.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// All knowledge entries for the story, in insertion order.
    async fn knowledge_entries(&self, story_id: &StoryId) -> Result<Vec<KnowledgeEntry>, StoreError>;

    /// The live world state.
    async fn world_snapshot(&self, story_id: &StoryId) -> Result<WorldSnapshot, StoreError>;

    /// Commit extracted world-state changes. Must be idempotent.
    async fn apply_world_update(
        &self,
        story_id: &StoryId,
        deltas: &[StateDelta],
    ) -> Result<(), StoreError>;

    /// Append to the narrative history.
    async fn append_story_entries(
        &self,
        story_id: &StoryId,
        entries: &[StoryEntry],
    ) -> Result<(), StoreError>;
}

/// Read-only lookup of the current chapter's narrative history.
#[async_trait]
pub trait ChapterEntryLookup: Send + Sync {
    /// The most recent `limit` story entries, oldest first.
    async fn recent_entries(
        &self,
        story_id: &StoryId,
        limit: usize,
    ) -> Result<Vec<StoryEntry>, StoreError>;
}

/// Renders prompt templates. Must be free of side effects.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, template: TemplateId, vars: &PromptVars) -> Result<String, RenderError>;
}

/// Receives pipeline events for the UI layer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}
