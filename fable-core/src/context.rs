//! Context assembly.
//!
//! Combines live world-state facts with the retrieved entries into one
//! ordered, size-bounded bundle. World facts come first, then Tier 1,
//! Tier 2 and Tier 3 entries in rank order. When the bundle is over
//! budget the lowest-ranked Tier 3 entries go first, then Tier 2; Tier 1
//! content is never trimmed.

use crate::entry::{EntryId, KnowledgeEntry};
use crate::retrieval::{RetrievalTier, ScoredEntry, TieredResult};
use crate::world::WorldSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const BLOCK_SEPARATOR: &str = "\n\n";

/// Size limits for the rendered context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum rendered length in characters.
    pub max_chars: usize,
    /// Maximum number of Tier 2 + Tier 3 entries kept.
    pub max_entries: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 12_000,
            max_entries: None,
        }
    }
}

impl ContextConfig {
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

/// Errors from context assembly.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("Tier 1 content needs {required} characters but the budget is {budget}")]
    Tier1OverBudget { required: usize, budget: usize },
}

/// Where a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BlockSource {
    WorldState,
    Entry(EntryId),
}

/// One rendered piece of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub source: BlockSource,
    pub tier: RetrievalTier,
    pub text: String,
}

impl ContextBlock {
    fn len(&self) -> usize {
        self.text.chars().count()
    }
}

/// The budget-constrained context for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub blocks: Vec<ContextBlock>,
    pub tier1: Vec<KnowledgeEntry>,
    pub tier2: Vec<KnowledgeEntry>,
    pub tier3: Vec<KnowledgeEntry>,
    pub rendered: String,
    /// Entries removed to fit the budget.
    pub trimmed: usize,
}

impl ContextBundle {
    /// Ids of every entry that made it into the bundle.
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.tier1
            .iter()
            .chain(&self.tier2)
            .chain(&self.tier3)
            .map(|e| e.id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Builds context bundles.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Assemble the bundle. Deterministic for identical inputs.
    pub fn build(&self, world: &WorldSnapshot, retrieved: &TieredResult) -> Result<ContextBundle, ContextError> {
        let world_blocks: Vec<ContextBlock> = world
            .fact_lines()
            .into_iter()
            .map(|line| ContextBlock {
                source: BlockSource::WorldState,
                tier: RetrievalTier::Tier1,
                text: line,
            })
            .collect();

        let tier1 = retrieved.tier1.clone();
        let mut tier2 = retrieved.tier2.clone();
        let mut tier3 = retrieved.tier3.clone();

        let fixed: Vec<ContextBlock> = world_blocks
            .into_iter()
            .chain(tier1.iter().map(entry_block))
            .collect();
        let fixed_len = rendered_len(&fixed);
        if fixed_len > self.config.max_chars {
            return Err(ContextError::Tier1OverBudget {
                required: fixed_len,
                budget: self.config.max_chars,
            });
        }

        let mut trimmed = 0;
        if let Some(max_entries) = self.config.max_entries {
            while tier2.len() + tier3.len() > max_entries {
                trim_lowest(&mut tier2, &mut tier3);
                trimmed += 1;
            }
        }

        loop {
            let blocks = assemble(&fixed, &tier2, &tier3);
            if rendered_len(&blocks) <= self.config.max_chars {
                if trimmed > 0 {
                    debug!(trimmed, max_chars = self.config.max_chars, "Trimmed context to budget");
                }
                let rendered = blocks
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .join(BLOCK_SEPARATOR);
                return Ok(ContextBundle {
                    blocks,
                    tier1: tier1.into_iter().map(|s| s.entry).collect(),
                    tier2: tier2.into_iter().map(|s| s.entry).collect(),
                    tier3: tier3.into_iter().map(|s| s.entry).collect(),
                    rendered,
                    trimmed,
                });
            }
            // Fixed content fits, so this always has something to remove
            trim_lowest(&mut tier2, &mut tier3);
            trimmed += 1;
        }
    }
}

fn entry_block(scored: &ScoredEntry) -> ContextBlock {
    ContextBlock {
        source: BlockSource::Entry(scored.entry.id),
        tier: scored.tier,
        text: scored.entry.render(),
    }
}

fn assemble(fixed: &[ContextBlock], tier2: &[ScoredEntry], tier3: &[ScoredEntry]) -> Vec<ContextBlock> {
    fixed
        .iter()
        .cloned()
        .chain(tier2.iter().map(entry_block))
        .chain(tier3.iter().map(entry_block))
        .collect()
}

fn trim_lowest(tier2: &mut Vec<ScoredEntry>, tier3: &mut Vec<ScoredEntry>) {
    if tier3.pop().is_none() {
        tier2.pop();
    }
}

fn rendered_len(blocks: &[ContextBlock]) -> usize {
    let content: usize = blocks.iter().map(ContextBlock::len).sum();
    content + BLOCK_SEPARATOR.len() * blocks.len().saturating_sub(1)
}
