//! The pipeline phases.
//!
//! Each phase reads what it needs from the `PipelineContext`, writes its
//! result back, and returns a `PhaseError` only for failures the sequencer
//! must act on. Recoverable problems are absorbed and logged inside the
//! phase.

pub mod classification;
pub mod image;
pub mod narrative;
pub mod post_generation;
pub mod pre_generation;
pub mod retrieval;
pub mod translation;

use super::config::ConfigError;
use super::context::Phase;
use crate::capability::{CapabilityError, GenerationProfile, RenderError, StoreError};
use crate::context::ContextError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures that stop the pipeline.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// The turn was cancelled. Not a failure; the sequencer reports it as
    /// an abort.
    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capability error: {0}")]
    Capability(CapabilityError),

    #[error("Narrative generation timed out after {0:?}")]
    NarrativeTimeout(Duration),

    #[error("Narrative generation produced no text")]
    EmptyNarrative,

    #[error("Empty user input")]
    EmptyInput,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Prompt error: {0}")]
    Render(#[from] RenderError),

    #[error("Checkpoint write failed: {0}")]
    Checkpoint(StoreError),
}

impl PhaseError {
    /// Whether this is a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PhaseError::Cancelled)
    }
}

impl From<CapabilityError> for PhaseError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Cancelled => PhaseError::Cancelled,
            other => PhaseError::Capability(other),
        }
    }
}

/// Await `call` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, CapabilityError>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CapabilityError::Cancelled),
        result = call => result,
    }
}

/// The profile configured for `phase`, or an unconfigured error.
pub(crate) fn profile(
    profile: &Option<GenerationProfile>,
    phase: Phase,
    capability: &'static str,
) -> Result<GenerationProfile, PhaseError> {
    profile
        .clone()
        .ok_or(PhaseError::Config(ConfigError::Unconfigured { phase, capability }))
}
