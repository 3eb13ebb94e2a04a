//! Tiered knowledge-entry retrieval.
//!
//! Tier 1 holds always-on and live-state entries, Tier 2 keyword and
//! distance matches (plus sticky entries), and Tier 3 whatever the
//! reranker picks from the remaining relevance-ranked pool.

pub mod activation;
pub mod config;
pub mod engine;
pub mod rerank;
pub mod scorer;

pub use activation::{ActivationState, ActivationTracker, STICKINESS_EPSILON};
pub use config::RetrievalConfig;
pub use engine::{EntryRetrievalEngine, ScoredEntry, TieredResult};
pub use rerank::{EntryReranker, EntrySelection, LlmReranker};
pub use scorer::{RetrievalTier, ScoreContext, Scorer};
