//! Relevance distance between a turn and a knowledge entry.
//!
//! Distances live in `[0, 1]`: 0 is an exact match, 1 is unrelated. The
//! scorer only measures; tier assignment happens in [`classify`], which
//! the retrieval engine applies on top of the measured distance.

use super::config::RetrievalConfig;
use crate::entry::{InjectionMode, KnowledgeEntry};
use serde::{Deserialize, Serialize};

/// Entry name equals a live world-state name.
pub const LIVE_STATE_DISTANCE: f32 = 0.0;
/// Entry name appears at a word boundary in the turn text.
pub const NAME_MATCH_DISTANCE: f32 = 0.15;
/// A keyword appears at a word boundary; lowered further by the matched fraction.
pub const KEYWORD_MATCH_DISTANCE: f32 = 0.35;
const KEYWORD_FRACTION_WEIGHT: f32 = 0.15;
/// Name or keyword appears in the recent narrative window.
pub const RECENT_MATCH_DISTANCE: f32 = 0.45;
/// A keyword appears only as a bare substring of the turn text.
pub const SUBSTRING_MATCH_DISTANCE: f32 = 0.6;
pub const UNRELATED_DISTANCE: f32 = 1.0;

/// Confidence level for why an entry was included this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetrievalTier {
    /// Always-inject or live-state derived.
    Tier1,
    /// Keyword or distance-threshold match.
    Tier2,
    /// Selected by the reranker.
    Tier3,
}

/// Where an entry lands after scoring, before caps and reranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Tier1,
    Tier2,
    Tier3Candidate,
    Dropped,
}

/// Normalized inputs for scoring one turn.
#[derive(Debug, Clone, Default)]
pub struct ScoreContext {
    turn_text: String,
    recent_entries: Vec<String>,
    live_names: Vec<String>,
}

impl ScoreContext {
    /// Build a scoring context. All text is lowercased once up front.
    pub fn new<I, S>(turn_text: &str, recent_entries: I, live_names: Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            turn_text: turn_text.to_lowercase(),
            recent_entries: recent_entries
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
            live_names: live_names.into_iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    pub fn turn_text(&self) -> &str {
        &self.turn_text
    }
}

/// Computes relevance distances.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer;

impl Scorer {
    pub fn new() -> Self {
        Self
    }

    /// Distance between the turn and `entry`. The smallest matching rule wins.
    pub fn score(&self, entry: &KnowledgeEntry, ctx: &ScoreContext) -> f32 {
        let name = entry.name.trim().to_lowercase();
        let keywords: Vec<String> = entry
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        if !name.is_empty() && ctx.live_names.iter().any(|live| *live == name) {
            return LIVE_STATE_DISTANCE;
        }

        let mut distance = UNRELATED_DISTANCE;

        if contains_word(&ctx.turn_text, &name) {
            distance = distance.min(NAME_MATCH_DISTANCE);
        }

        if !keywords.is_empty() {
            let matched = keywords
                .iter()
                .filter(|k| contains_word(&ctx.turn_text, k))
                .count();
            if matched > 0 {
                let fraction = matched as f32 / keywords.len() as f32;
                distance = distance.min(KEYWORD_MATCH_DISTANCE - KEYWORD_FRACTION_WEIGHT * fraction);
            } else if keywords.iter().any(|k| ctx.turn_text.contains(k.as_str())) {
                distance = distance.min(SUBSTRING_MATCH_DISTANCE);
            }
        }

        let in_recent = ctx.recent_entries.iter().any(|text| {
            contains_word(text, &name) || keywords.iter().any(|k| contains_word(text, k))
        });
        if in_recent {
            distance = distance.min(RECENT_MATCH_DISTANCE);
        }

        distance.clamp(0.0, 1.0)
    }
}

/// Apply the tier assignment rule to a measured distance.
pub fn classify(
    mode: InjectionMode,
    distance: f32,
    sticky: bool,
    config: &RetrievalConfig,
) -> Placement {
    match mode {
        InjectionMode::Never => Placement::Dropped,
        InjectionMode::Always => Placement::Tier1,
        InjectionMode::KeywordTriggered | InjectionMode::RelevanceRanked => {
            if distance <= config.tier1_threshold {
                Placement::Tier1
            } else if distance <= config.tier2_threshold || sticky {
                Placement::Tier2
            } else if mode == InjectionMode::RelevanceRanked {
                Placement::Tier3Candidate
            } else {
                Placement::Dropped
            }
        }
    }
}

/// Ranking distance after stickiness boosts, clamped to `[0, 1]`.
///
/// Sticky entries get `tier2_boost`; any tracked stickiness adds
/// `tier3_boost * stickiness`. Both boosts are additive.
pub fn boosted_distance(distance: f32, sticky: bool, stickiness: f32, config: &RetrievalConfig) -> f32 {
    let mut boosted = distance;
    if sticky {
        boosted -= config.tier2_boost;
    }
    boosted -= config.tier3_boost * stickiness.clamp(0.0, 1.0);
    boosted.clamp(0.0, 1.0)
}

/// Check if `text` contains `word` at word boundaries.
///
/// A word boundary is the start/end of the string or a non-alphanumeric
/// character, so multi-word names match as phrases and "Thor" does not
/// match inside "Thorin".
pub(crate) fn contains_word(text: &str, word: &str) -> bool {
    if word.is_empty() || word.len() > text.len() {
        return false;
    }

    text.match_indices(word).any(|(i, _)| {
        let left_ok = text[..i].chars().next_back().map_or(true, |c| !c.is_alphanumeric());
        let right_ok = text[i + word.len()..].chars().next().map_or(true, |c| !c.is_alphanumeric());
        left_ok && right_ok
    })
}
