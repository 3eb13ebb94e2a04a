//! Tiered entry selection for one turn.

use super::activation::ActivationTracker;
use super::config::RetrievalConfig;
use super::rerank::EntryReranker;
use super::scorer::{boosted_distance, classify, Placement, RetrievalTier, ScoreContext, Scorer};
use crate::capability::CapabilityError;
use crate::entry::{EntryId, InjectionMode, KnowledgeEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An entry selected for this turn, with the numbers that placed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub tier: RetrievalTier,
    /// Raw scorer distance.
    pub distance: f32,
    /// Distance after stickiness boosts; used for ranking only.
    pub boosted_distance: f32,
}

/// Retrieval output, each tier in rank order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieredResult {
    pub tier1: Vec<ScoredEntry>,
    pub tier2: Vec<ScoredEntry>,
    pub tier3: Vec<ScoredEntry>,
}

impl TieredResult {
    /// All entries, Tier 1 first.
    pub fn all(&self) -> impl Iterator<Item = &ScoredEntry> {
        self.tier1.iter().chain(&self.tier2).chain(&self.tier3)
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.all().map(|s| s.entry.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tier1.len() + self.tier2.len() + self.tier3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A scored entry awaiting its final tier.
struct Ranked<'a> {
    index: usize,
    entry: &'a KnowledgeEntry,
    distance: f32,
    boosted: f32,
    last_activated: Option<u32>,
}

impl Ranked<'_> {
    fn into_scored(self, tier: RetrievalTier) -> ScoredEntry {
        ScoredEntry {
            entry: self.entry.clone(),
            tier,
            distance: self.distance,
            boosted_distance: self.boosted,
        }
    }
}

/// Closest first, then higher priority, then more recently activated,
/// then insertion order.
fn rank_order(a: &Ranked<'_>, b: &Ranked<'_>) -> Ordering {
    a.boosted
        .total_cmp(&b.boosted)
        .then_with(|| b.entry.priority.cmp(&a.entry.priority))
        .then_with(|| b.last_activated.cmp(&a.last_activated))
        .then_with(|| a.index.cmp(&b.index))
}

/// Selects Tier 1/2/3 entries over a story's knowledge base.
#[derive(Debug, Clone, Default)]
pub struct EntryRetrievalEngine {
    config: RetrievalConfig,
    scorer: Scorer,
}

impl EntryRetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            scorer: Scorer::new(),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Produce the tiered result for `turn_index`.
    ///
    /// Tracked entries are decayed to `turn_index` first; since decay is
    /// computed from the activation peak, repeating the call with the same
    /// inputs gives the same result. Activations are recorded separately
    /// with [`activate_selected`](Self::activate_selected).
    ///
    /// The rerank call is bounded by `rerank_timeout_ms` and by `cancel`;
    /// any failure leaves Tier 3 empty.
    pub async fn retrieve(
        &self,
        entries: &[KnowledgeEntry],
        ctx: &ScoreContext,
        tracker: &mut ActivationTracker,
        turn_index: u32,
        reranker: Option<&dyn EntryReranker>,
        cancel: &CancellationToken,
    ) -> TieredResult {
        tracker.decay_all(turn_index, self.config.decay_factor);

        let mut seen = HashSet::new();
        let mut tier1 = Vec::new();
        let mut tier2 = Vec::new();
        let mut candidates = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            if entry.mode == InjectionMode::Never || !seen.insert(entry.id) {
                continue;
            }

            let distance = self.scorer.score(entry, ctx);
            let sticky = tracker.is_sticky(entry.id);
            let ranked = Ranked {
                index,
                entry,
                distance,
                boosted: boosted_distance(distance, sticky, tracker.stickiness(entry.id), &self.config),
                last_activated: tracker.last_activated_turn(entry.id),
            };

            match classify(entry.mode, distance, sticky, &self.config) {
                Placement::Tier1 => tier1.push(ranked),
                Placement::Tier2 => tier2.push(ranked),
                Placement::Tier3Candidate => candidates.push(ranked),
                Placement::Dropped => {}
            }
        }

        tier1.sort_by(rank_order);
        tier2.sort_by(rank_order);
        candidates.sort_by(rank_order);

        if let Some(cap) = self.config.max_tier1 {
            let mut kept = 0;
            tier1.retain(|r| {
                if r.entry.mode == InjectionMode::Always {
                    return true;
                }
                kept += 1;
                kept <= cap
            });
        }
        tier2.truncate(self.config.max_tier2);

        let tier3 = self.select_tier3(candidates, ctx, reranker, cancel).await;

        let result = TieredResult {
            tier1: tier1.into_iter().map(|r| r.into_scored(RetrievalTier::Tier1)).collect(),
            tier2: tier2.into_iter().map(|r| r.into_scored(RetrievalTier::Tier2)).collect(),
            tier3: tier3.into_iter().map(|r| r.into_scored(RetrievalTier::Tier3)).collect(),
        };
        debug!(
            turn = turn_index,
            tier1 = result.tier1.len(),
            tier2 = result.tier2.len(),
            tier3 = result.tier3.len(),
            "Retrieved entries"
        );
        result
    }

    /// Record every selected entry as activated on `turn_index`.
    pub fn activate_selected(&self, result: &TieredResult, tracker: &mut ActivationTracker, turn_index: u32) {
        for scored in result.all() {
            tracker.activate(scored.entry.id, turn_index);
        }
    }

    async fn select_tier3<'a>(
        &self,
        candidates: Vec<Ranked<'a>>,
        ctx: &ScoreContext,
        reranker: Option<&dyn EntryReranker>,
        cancel: &CancellationToken,
    ) -> Vec<Ranked<'a>> {
        let Some(reranker) = reranker else {
            return Vec::new();
        };
        if !self.config.llm_selection
            || self.config.max_tier3 == 0
            || candidates.is_empty()
            || candidates.len() <= self.config.tier3_min_candidates
        {
            return Vec::new();
        }

        let refs: Vec<&KnowledgeEntry> = candidates.iter().map(|r| r.entry).collect();
        let timeout = Duration::from_millis(self.config.rerank_timeout_ms);
        let call = reranker.select(&refs, ctx.turn_text(), self.config.max_tier3, cancel);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CapabilityError::Cancelled),
            result = tokio::time::timeout(timeout, call) => {
                result.unwrap_or_else(|_| Err(CapabilityError::Timeout(timeout)))
            }
        };

        let accepted: HashSet<EntryId> = match outcome {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(candidates = candidates.len(), error = %e, "Tier 3 selection failed, continuing without it");
                return Vec::new();
            }
        };

        let mut selected: Vec<Ranked<'a>> = candidates
            .into_iter()
            .filter(|r| accepted.contains(&r.entry.id))
            .collect();
        selected.truncate(self.config.max_tier3);
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Accepts every candidate, counting calls.
    #[derive(Default)]
    struct AcceptAll {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EntryReranker for AcceptAll {
        async fn select(
            &self,
            candidates: &[&KnowledgeEntry],
            _turn_text: &str,
            _max_selected: usize,
            _cancel: &CancellationToken,
        ) -> Result<Vec<EntryId>, CapabilityError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(candidates.iter().rev().map(|e| e.id).collect())
        }
    }

    /// Never answers.
    struct Stalled;

    #[async_trait]
    impl EntryReranker for Stalled {
        async fn select(
            &self,
            _candidates: &[&KnowledgeEntry],
            _turn_text: &str,
            _max_selected: usize,
            _cancel: &CancellationToken,
        ) -> Result<Vec<EntryId>, CapabilityError> {
            std::future::pending().await
        }
    }

    fn ctx(turn: &str) -> ScoreContext {
        ScoreContext::new(turn, Vec::<String>::new(), Vec::new())
    }

    fn ranked(n: usize) -> Vec<KnowledgeEntry> {
        (0..n)
            .map(|i| KnowledgeEntry::new(format!("Lore {i}"), "Background.", InjectionMode::RelevanceRanked))
            .collect()
    }

    #[tokio::test]
    async fn test_tie_break_priority_then_insertion() {
        let engine = EntryRetrievalEngine::default();
        let mut tracker = ActivationTracker::new(0.3);
        let low = KnowledgeEntry::new("A", "a", InjectionMode::KeywordTriggered).with_keywords(["bell"]);
        let high = KnowledgeEntry::new("B", "b", InjectionMode::KeywordTriggered)
            .with_keywords(["bell"])
            .with_priority(5);
        let same = KnowledgeEntry::new("C", "c", InjectionMode::KeywordTriggered).with_keywords(["bell"]);

        let result = engine
            .retrieve(
                &[low.clone(), high.clone(), same.clone()],
                &ctx("the bell rings"),
                &mut tracker,
                1,
                None,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.ids(), vec![high.id, low.id, same.id]);
    }

    #[tokio::test]
    async fn test_sticky_entry_kept_in_tier2() {
        let engine = EntryRetrievalEngine::default();
        let mut tracker = ActivationTracker::new(0.3);
        let entry = KnowledgeEntry::new("Mara", "Ferrywoman.", InjectionMode::KeywordTriggered);
        tracker.activate(entry.id, 3);

        let result = engine
            .retrieve(
                std::slice::from_ref(&entry),
                &ctx("I walk on"),
                &mut tracker,
                5,
                None,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.tier2.len(), 1);
        assert_eq!(result.tier2[0].distance, 1.0);
        assert!(result.tier2[0].boosted_distance < 1.0);
    }

    #[tokio::test]
    async fn test_tier2_cap_does_not_demote() {
        let engine = EntryRetrievalEngine::new(RetrievalConfig::default().with_caps(1, 6));
        let mut tracker = ActivationTracker::new(0.3);
        let entries: Vec<KnowledgeEntry> = (0..3)
            .map(|i| {
                KnowledgeEntry::new(format!("E{i}"), "x", InjectionMode::RelevanceRanked)
                    .with_keywords(["fog"])
            })
            .collect();
        let reranker = AcceptAll::default();

        let result = engine
            .retrieve(&entries, &ctx("fog"), &mut tracker, 0, Some(&reranker), &CancellationToken::new())
            .await;

        assert_eq!(result.tier2.len(), 1);
        assert!(result.tier3.is_empty());
        assert_eq!(reranker.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tier3_keeps_candidate_order_and_cap() {
        let engine = EntryRetrievalEngine::new(RetrievalConfig::default().with_caps(12, 2));
        let mut tracker = ActivationTracker::new(0.3);
        let entries = ranked(4);
        let reranker = AcceptAll::default();

        let result = engine
            .retrieve(&entries, &ctx("hello"), &mut tracker, 0, Some(&reranker), &CancellationToken::new())
            .await;

        assert_eq!(reranker.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(result.tier3.len(), 2);
        assert_eq!(result.tier3[0].entry.id, entries[0].id);
        assert_eq!(result.tier3[1].entry.id, entries[1].id);
        assert!(result.tier3.iter().all(|s| s.tier == RetrievalTier::Tier3));
    }

    #[tokio::test]
    async fn test_min_candidates_skips_rerank() {
        let mut config = RetrievalConfig::default();
        config.tier3_min_candidates = 5;
        let engine = EntryRetrievalEngine::new(config);
        let mut tracker = ActivationTracker::new(0.3);
        let reranker = AcceptAll::default();

        let result = engine
            .retrieve(&ranked(5), &ctx("hello"), &mut tracker, 0, Some(&reranker), &CancellationToken::new())
            .await;

        assert!(result.tier3.is_empty());
        assert_eq!(reranker.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerank_timeout_degrades() {
        let engine = EntryRetrievalEngine::default();
        let mut tracker = ActivationTracker::new(0.3);
        let always = KnowledgeEntry::new("Rules", "Magic is rare.", InjectionMode::Always);
        let mut entries = ranked(3);
        entries.push(always.clone());

        let result = engine
            .retrieve(&entries, &ctx("hello"), &mut tracker, 0, Some(&Stalled), &CancellationToken::new())
            .await;

        assert!(result.tier3.is_empty());
        assert_eq!(result.ids(), vec![always.id]);
    }

    #[tokio::test]
    async fn test_cancel_during_rerank() {
        let engine = EntryRetrievalEngine::default();
        let mut tracker = ActivationTracker::new(0.3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .retrieve(&ranked(3), &ctx("hello"), &mut tracker, 0, Some(&Stalled), &cancel)
            .await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_max_tier1_exempts_always() {
        let mut config = RetrievalConfig::default();
        config.max_tier1 = Some(1);
        let engine = EntryRetrievalEngine::new(config);
        let mut tracker = ActivationTracker::new(0.3);

        let always = KnowledgeEntry::new("Rules", "r", InjectionMode::Always);
        let live_a = KnowledgeEntry::new("Docks", "d", InjectionMode::RelevanceRanked);
        let live_b = KnowledgeEntry::new("Mara", "m", InjectionMode::RelevanceRanked);
        let live = ScoreContext::new("look", Vec::<String>::new(), vec!["docks".into(), "mara".into()]);

        let result = engine
            .retrieve(
                &[always.clone(), live_a.clone(), live_b],
                &live,
                &mut tracker,
                0,
                None,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.tier1.len(), 2);
        assert_eq!(result.tier1[0].entry.id, live_a.id);
        assert_eq!(result.tier1[1].entry.id, always.id);
    }

    #[tokio::test]
    async fn test_activate_selected() {
        let engine = EntryRetrievalEngine::default();
        let mut tracker = ActivationTracker::new(0.3);
        let entry = KnowledgeEntry::new("Rules", "r", InjectionMode::Always);

        let result = engine
            .retrieve(
                std::slice::from_ref(&entry),
                &ctx("x"),
                &mut tracker,
                7,
                None,
                &CancellationToken::new(),
            )
            .await;
        engine.activate_selected(&result, &mut tracker, 7);

        assert_eq!(tracker.last_activated_turn(entry.id), Some(7));
        assert!(tracker.is_sticky(entry.id));
    }
}
