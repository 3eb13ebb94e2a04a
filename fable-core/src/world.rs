//! Live world state.
//!
//! A `WorldSnapshot` is the ground truth the story currently stands on:
//! where the scene is, who is present, what the protagonist carries and
//! which quest threads are open. It is never scored; the context builder
//! always places it in Tier 1.

use serde::{Deserialize, Serialize};

/// Snapshot of the live world state for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub location: Option<String>,
    #[serde(default)]
    pub present_characters: Vec<String>,
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default)]
    pub active_quests: Vec<String>,
}

impl WorldSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_character(mut self, name: impl Into<String>) -> Self {
        push_unique(&mut self.present_characters, name.into());
        self
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        push_unique(&mut self.inventory, item.into());
        self
    }

    pub fn with_quest(mut self, quest: impl Into<String>) -> Self {
        push_unique(&mut self.active_quests, quest.into());
        self
    }

    /// Every name that marks an entry as live-state derived, lowercased.
    pub fn live_names(&self) -> Vec<String> {
        self.location
            .iter()
            .chain(&self.present_characters)
            .chain(&self.inventory)
            .chain(&self.active_quests)
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Render the snapshot as ordered fact lines. Empty sections are skipped.
    pub fn fact_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(ref location) = self.location {
            lines.push(format!("Current location: {location}"));
        }
        if !self.present_characters.is_empty() {
            lines.push(format!(
                "Present characters: {}",
                self.present_characters.join(", ")
            ));
        }
        if !self.inventory.is_empty() {
            lines.push(format!("Inventory: {}", self.inventory.join(", ")));
        }
        if !self.active_quests.is_empty() {
            lines.push(format!("Active quests: {}", self.active_quests.join(", ")));
        }
        lines
    }

    /// Apply a single state change. Returns whether anything changed.
    pub fn apply(&mut self, delta: &StateDelta) -> bool {
        match delta {
            StateDelta::LocationChanged { location } => {
                if self.location.as_deref() == Some(location.as_str()) {
                    return false;
                }
                self.location = Some(location.clone());
                true
            }
            StateDelta::CharacterEntered { name } => {
                push_unique(&mut self.present_characters, name.clone())
            }
            StateDelta::CharacterLeft { name } => remove_named(&mut self.present_characters, name),
            StateDelta::ItemGained { item } => push_unique(&mut self.inventory, item.clone()),
            StateDelta::ItemLost { item } => remove_named(&mut self.inventory, item),
            StateDelta::QuestStarted { title } => {
                push_unique(&mut self.active_quests, title.clone())
            }
            StateDelta::QuestCompleted { title } => remove_named(&mut self.active_quests, title),
        }
    }

    /// Apply a batch of changes in order.
    pub fn apply_all(&mut self, deltas: &[StateDelta]) -> usize {
        deltas.iter().filter(|delta| self.apply(delta)).count()
    }
}

/// A world-state change extracted from generated narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateDelta {
    LocationChanged { location: String },
    CharacterEntered { name: String },
    CharacterLeft { name: String },
    ItemGained { item: String },
    ItemLost { item: String },
    QuestStarted { title: String },
    QuestCompleted { title: String },
}

fn push_unique(list: &mut Vec<String>, value: String) -> bool {
    let value = value.trim().to_string();
    if value.is_empty() || list.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
        return false;
    }
    list.push(value);
    true
}

fn remove_named(list: &mut Vec<String>, value: &str) -> bool {
    let before = list.len();
    list.retain(|v| !v.eq_ignore_ascii_case(value.trim()));
    list.len() != before
}
