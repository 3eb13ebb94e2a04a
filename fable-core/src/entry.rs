//! Knowledge entries and narrative history.
//!
//! Knowledge entries are owned by the persistent store and are read-only
//! to the core for the duration of a turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a knowledge entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new unique entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse an ID from its string form, as echoed back by a model.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a story; every turn and checkpoint is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(String);

impl StoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How an entry finds its way into the generation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Injected every turn as a Tier 1 fact.
    Always,
    /// Injected only when a keyword or its name matches.
    KeywordTriggered,
    /// Scored by distance; may be selected by the reranker.
    RelevanceRanked,
    /// Never injected.
    Never,
}

impl InjectionMode {
    /// Get the display name for this mode.
    pub fn name(&self) -> &'static str {
        match self {
            InjectionMode::Always => "always",
            InjectionMode::KeywordTriggered => "keyword-triggered",
            InjectionMode::RelevanceRanked => "relevance-ranked",
            InjectionMode::Never => "never",
        }
    }
}

/// A unit of world knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    /// Display name, also matched against the turn text.
    pub name: String,
    /// Free-text body injected into the context.
    pub body: String,
    /// Trigger keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub mode: InjectionMode,
    /// Static priority weight; higher wins ties.
    #[serde(default)]
    pub priority: i32,
}

impl KnowledgeEntry {
    /// Create an entry with a fresh ID.
    pub fn new(name: impl Into<String>, body: impl Into<String>, mode: InjectionMode) -> Self {
        Self {
            id: EntryId::new(),
            name: name.into(),
            body: body.into(),
            keywords: Vec::new(),
            mode,
            priority: 0,
        }
    }

    /// Set the trigger keywords.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Set the static priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A short summary used in reranking prompts.
    pub fn summary(&self, max_chars: usize) -> String {
        let body = self.body.trim();
        if body.chars().count() <= max_chars {
            body.to_string()
        } else {
            let truncated: String = body.chars().take(max_chars).collect();
            format!("{truncated}...")
        }
    }

    /// Render the entry as a context block.
    pub fn render(&self) -> String {
        format!("[{}]\n{}", self.name, self.body.trim())
    }
}

/// Who produced a piece of narrative history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryEntryKind {
    UserAction,
    Narration,
}

/// One element of the story so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEntry {
    pub kind: StoryEntryKind,
    pub content: String,
}

impl StoryEntry {
    pub fn user_action(content: impl Into<String>) -> Self {
        Self {
            kind: StoryEntryKind::UserAction,
            content: content.into(),
        }
    }

    pub fn narration(content: impl Into<String>) -> Self {
        Self {
            kind: StoryEntryKind::Narration,
            content: content.into(),
        }
    }
}
