//! Tier 3 selection by a language model.
//!
//! When deterministic rules leave a candidate pool that is too large, a
//! cheap model call picks the entries the storyteller actually needs.

use crate::capability::{
    CapabilityError, GenerationProfile, GenerationRequest, PromptRenderer, TextGenerator,
};
use crate::entry::{EntryId, KnowledgeEntry};
use crate::prompts::{PromptVars, TemplateId};
use crate::structured;
use crate::OutputSchema;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Length of each candidate summary shown to the model.
const SUMMARY_CHARS: usize = 200;

/// Chooses a subset of Tier 3 candidates.
#[async_trait]
pub trait EntryReranker: Send + Sync {
    /// Return the accepted entry ids. Ids not among `candidates` are ignored
    /// by the caller.
    async fn select(
        &self,
        candidates: &[&KnowledgeEntry],
        turn_text: &str,
        max_selected: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntryId>, CapabilityError>;
}

/// The model's selection.
#[derive(Debug, Deserialize, OutputSchema)]
#[schema(name = "entry_selection")]
pub struct EntrySelection {
    /// Ids of the entries needed this turn, most useful first.
    pub selected: Vec<String>,
}

/// Reranker backed by a text-generation capability.
pub struct LlmReranker {
    generator: Arc<dyn TextGenerator>,
    renderer: Arc<dyn PromptRenderer>,
    profile: GenerationProfile,
}

impl LlmReranker {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        renderer: Arc<dyn PromptRenderer>,
        profile: GenerationProfile,
    ) -> Self {
        Self {
            generator,
            renderer,
            profile,
        }
    }

    fn candidate_list(candidates: &[&KnowledgeEntry]) -> String {
        candidates
            .iter()
            .map(|entry| format!("- {}: {}: {}", entry.id, entry.name, entry.summary(SUMMARY_CHARS)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl EntryReranker for LlmReranker {
    async fn select(
        &self,
        candidates: &[&KnowledgeEntry],
        turn_text: &str,
        max_selected: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntryId>, CapabilityError> {
        let vars = PromptVars::new()
            .with("turn_text", turn_text)
            .with("candidates", Self::candidate_list(candidates))
            .with("max_selected", max_selected.to_string());
        let prompt = self
            .renderer
            .render(TemplateId::Rerank, &vars)
            .map_err(|e| CapabilityError::Rejected(e.to_string()))?;

        let request = GenerationRequest::new(self.profile.clone(), prompt)
            .with_user("Select the entries needed for this turn.");
        let selection: EntrySelection =
            structured::extract(self.generator.as_ref(), request, cancel).await?;

        // Unknown ids are dropped rather than failing the whole selection
        let ids: Vec<EntryId> = selection
            .selected
            .iter()
            .filter_map(|raw| EntryId::parse(raw))
            .collect();
        debug!(
            returned = selection.selected.len(),
            parsed = ids.len(),
            "Reranker selection"
        );
        Ok(ids)
    }
}
