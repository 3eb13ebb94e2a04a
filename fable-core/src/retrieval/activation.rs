//! Per-entry recency state.
//!
//! Stickiness starts at 1.0 when an entry is activated and decays
//! geometrically with the number of turns since that activation, so an
//! entry fades out of context over a few turns instead of vanishing the
//! moment the conversation drifts.

use super::config::RetrievalConfig;
use crate::entry::EntryId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stickiness below which an entry is dropped from tracking.
pub const STICKINESS_EPSILON: f32 = 0.05;

/// Tracking state for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationState {
    pub last_activated_turn: u32,
    /// Decayed stickiness in `[0, 1]`.
    pub stickiness: f32,
    pub active: bool,
}

/// Tracks which entries have recently been in scene.
#[derive(Debug, Clone)]
pub struct ActivationTracker {
    states: HashMap<EntryId, ActivationState>,
    sticky_threshold: f32,
}

impl Default for ActivationTracker {
    fn default() -> Self {
        Self::new(RetrievalConfig::default().sticky_threshold)
    }
}

impl ActivationTracker {
    /// Create a tracker with the given sticky threshold.
    pub fn new(sticky_threshold: f32) -> Self {
        Self {
            states: HashMap::new(),
            sticky_threshold,
        }
    }

    /// Mark an entry as activated on `turn_index`.
    pub fn activate(&mut self, entry_id: EntryId, turn_index: u32) {
        self.states.insert(
            entry_id,
            ActivationState {
                last_activated_turn: turn_index,
                stickiness: 1.0,
                active: true,
            },
        );
    }

    /// Decay one entry to `current_turn`.
    ///
    /// Stickiness is recomputed from the activation peak as
    /// `decay_factor ^ (current_turn - last_activated_turn)`, so repeated
    /// calls for the same turn are idempotent. Entries that fall below
    /// [`STICKINESS_EPSILON`] are forgotten.
    pub fn decay(&mut self, entry_id: EntryId, current_turn: u32, decay_factor: f32) {
        let Some(state) = self.states.get_mut(&entry_id) else {
            return;
        };

        let elapsed = current_turn.saturating_sub(state.last_activated_turn);
        let exponent = i32::try_from(elapsed).unwrap_or(i32::MAX);
        state.stickiness = decay_factor.clamp(0.0, 1.0).powi(exponent).clamp(0.0, 1.0);

        if state.stickiness < STICKINESS_EPSILON {
            self.states.remove(&entry_id);
        } else {
            state.active = elapsed == 0;
        }
    }

    /// Decay every tracked entry to `current_turn`.
    pub fn decay_all(&mut self, current_turn: u32, decay_factor: f32) {
        let ids: Vec<EntryId> = self.states.keys().copied().collect();
        for id in ids {
            self.decay(id, current_turn, decay_factor);
        }
    }

    /// Whether the entry's decayed stickiness exceeds the sticky threshold.
    pub fn is_sticky(&self, entry_id: EntryId) -> bool {
        self.stickiness(entry_id) > self.sticky_threshold
    }

    /// Current stickiness, 0.0 for untracked entries.
    pub fn stickiness(&self, entry_id: EntryId) -> f32 {
        self.states
            .get(&entry_id)
            .map(|s| s.stickiness)
            .unwrap_or(0.0)
    }

    pub fn state(&self, entry_id: EntryId) -> Option<&ActivationState> {
        self.states.get(&entry_id)
    }

    pub fn last_activated_turn(&self, entry_id: EntryId) -> Option<u32> {
        self.states.get(&entry_id).map(|s| s.last_activated_turn)
    }

    pub fn sticky_threshold(&self) -> f32 {
        self.sticky_threshold
    }

    /// Change the threshold, e.g. when a new turn brings a new config.
    pub fn set_sticky_threshold(&mut self, sticky_threshold: f32) {
        self.sticky_threshold = sticky_threshold;
    }

    /// Number of tracked entries.
    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}
