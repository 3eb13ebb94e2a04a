//! Pipeline configuration snapshot.
//!
//! A `PipelineConfig` is captured once when a turn starts and travels
//! with the `PipelineContext`; nothing reads shared settings mid-turn.

use super::context::Phase;
use super::PipelineServices;
use crate::capability::GenerationProfile;
use crate::context::ContextConfig;
use crate::retrieval::RetrievalConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Raised before any external call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unconfigured capability: {phase} needs {capability}")]
    Unconfigured {
        phase: Phase,
        capability: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generation parameters per LLM-backed step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseModels {
    pub narrative: Option<GenerationProfile>,
    pub classification: Option<GenerationProfile>,
    pub rerank: Option<GenerationProfile>,
    pub translation: Option<GenerationProfile>,
    pub scene_planning: Option<GenerationProfile>,
    pub suggestions: Option<GenerationProfile>,
}

/// Narrative translation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Language name as given to the model, e.g. "German".
    pub target_language: String,
}

impl TranslationConfig {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            target_language: target_language.into(),
        }
    }
}

/// Scene illustration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Upper bound on images generated per turn.
    pub max_scenes: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { max_scenes: 2 }
    }
}

/// Immutable configuration for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub models: PhaseModels,
    pub narrative_timeout_ms: u64,
    /// Translation runs only when set.
    pub translation: Option<TranslationConfig>,
    /// The image phase runs only when set.
    pub images: Option<ImageConfig>,
    pub suggestions_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            context: ContextConfig::default(),
            models: PhaseModels::default(),
            narrative_timeout_ms: 120_000,
            translation: None,
            images: None,
            suggestions_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Create a config that uses one profile for every LLM step.
    pub fn with_single_model(profile: GenerationProfile) -> Self {
        Self {
            models: PhaseModels {
                narrative: Some(profile.clone()),
                classification: Some(profile.clone()),
                rerank: Some(profile.clone()),
                translation: Some(profile.clone()),
                scene_planning: Some(profile.clone()),
                suggestions: Some(profile),
            },
            ..Self::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        let config: PipelineConfig = serde_json::from_str(&json)?;
        config.check_values()?;
        Ok(config)
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_models(mut self, models: PhaseModels) -> Self {
        self.models = models;
        self
    }

    pub fn with_narrative_timeout(mut self, timeout: Duration) -> Self {
        self.narrative_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_translation(mut self, target_language: impl Into<String>) -> Self {
        self.translation = Some(TranslationConfig::new(target_language));
        self
    }

    pub fn with_images(mut self, max_scenes: usize) -> Self {
        self.images = Some(ImageConfig { max_scenes });
        self
    }

    pub fn with_suggestions(mut self, enabled: bool) -> Self {
        self.suggestions_enabled = enabled;
        self
    }

    pub fn narrative_timeout(&self) -> Duration {
        Duration::from_millis(self.narrative_timeout_ms)
    }

    /// Check that every phase that will run has what it needs.
    pub fn validate(&self, services: &PipelineServices) -> Result<(), ConfigError> {
        self.check_values()?;

        require(&self.models.narrative, Phase::Narrative, "a narrative model")?;
        require(&self.models.classification, Phase::Classification, "a classification model")?;
        if self.retrieval.llm_selection {
            require(&self.models.rerank, Phase::Retrieval, "a rerank model")?;
        }
        if self.translation.is_some() {
            require(&self.models.translation, Phase::Translation, "a translation model")?;
        }
        if self.images.is_some() {
            require(&self.models.scene_planning, Phase::Image, "a scene planning model")?;
            if services.images.is_none() {
                return Err(ConfigError::Unconfigured {
                    phase: Phase::Image,
                    capability: "an image generator",
                });
            }
        }
        if self.suggestions_enabled {
            require(&self.models.suggestions, Phase::PostGeneration, "a suggestions model")?;
        }
        Ok(())
    }

    fn check_values(&self) -> Result<(), ConfigError> {
        self.retrieval.check().map_err(ConfigError::Invalid)?;
        if self.context.max_chars == 0 {
            return Err(ConfigError::Invalid("context.max_chars must be positive".to_string()));
        }
        if self.narrative_timeout_ms == 0 {
            return Err(ConfigError::Invalid("narrative_timeout_ms must be positive".to_string()));
        }
        if let Some(ref translation) = self.translation {
            if translation.target_language.trim().is_empty() {
                return Err(ConfigError::Invalid("translation.target_language is empty".to_string()));
            }
        }
        Ok(())
    }
}

fn require(
    profile: &Option<GenerationProfile>,
    phase: Phase,
    capability: &'static str,
) -> Result<(), ConfigError> {
    match profile {
        Some(_) => Ok(()),
        None => Err(ConfigError::Unconfigured { phase, capability }),
    }
}
