//! Retrieval tuning knobs.

use serde::{Deserialize, Serialize};

/// Configuration for tiered entry retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Distances at or below this are Tier 1.
    pub tier1_threshold: f32,
    /// Distances at or below this (and above `tier1_threshold`) are Tier 2.
    pub tier2_threshold: f32,
    /// Distance reduction applied to sticky entries.
    pub tier2_boost: f32,
    /// Distance reduction per unit of stickiness.
    pub tier3_boost: f32,
    /// Per-turn stickiness decay factor, in `(0, 1)`.
    pub decay_factor: f32,
    /// Stickiness above which an entry counts as sticky.
    pub sticky_threshold: f32,
    /// Cap on score-derived Tier 1 entries. `Always` entries are never capped.
    pub max_tier1: Option<usize>,
    pub max_tier2: usize,
    pub max_tier3: usize,
    /// Whether the reranker may select Tier 3 entries.
    pub llm_selection: bool,
    /// The reranker is only called when candidates exceed this count.
    pub tier3_min_candidates: usize,
    pub rerank_timeout_ms: u64,
    /// Number of recent story entries scanned for matches.
    pub recent_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            tier1_threshold: 0.05,
            tier2_threshold: 0.5,
            tier2_boost: 0.15,
            tier3_boost: 0.05,
            decay_factor: 0.9,
            sticky_threshold: 0.3,
            max_tier1: None,
            max_tier2: 12,
            max_tier3: 6,
            llm_selection: true,
            tier3_min_candidates: 0,
            rerank_timeout_ms: 8_000,
            recent_window: 6,
        }
    }
}

impl RetrievalConfig {
    pub fn with_thresholds(mut self, tier1: f32, tier2: f32) -> Self {
        self.tier1_threshold = tier1;
        self.tier2_threshold = tier2;
        self
    }

    pub fn with_decay(mut self, decay_factor: f32, sticky_threshold: f32) -> Self {
        self.decay_factor = decay_factor;
        self.sticky_threshold = sticky_threshold;
        self
    }

    pub fn with_caps(mut self, max_tier2: usize, max_tier3: usize) -> Self {
        self.max_tier2 = max_tier2;
        self.max_tier3 = max_tier3;
        self
    }

    pub fn with_llm_selection(mut self, enabled: bool) -> Self {
        self.llm_selection = enabled;
        self
    }

    /// Check value ranges, returning a description of the first problem.
    pub fn check(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.tier1_threshold)
            || !(0.0..=1.0).contains(&self.tier2_threshold)
        {
            return Err("tier thresholds must lie in [0, 1]".to_string());
        }
        if self.tier1_threshold > self.tier2_threshold {
            return Err("tier1_threshold must not exceed tier2_threshold".to_string());
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(format!("decay_factor {} must lie in (0, 1)", self.decay_factor));
        }
        if self.tier2_boost < 0.0 || self.tier3_boost < 0.0 {
            return Err("boosts must be non-negative".to_string());
        }
        Ok(())
    }
}
