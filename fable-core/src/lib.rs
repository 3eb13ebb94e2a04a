//! Context retrieval and generation pipeline for interactive fiction.
//!
//! This crate provides:
//! - Tiered knowledge-entry retrieval with decaying activation
//! - Budgeted context assembly over live world state
//! - A cancellable, resumable generation pipeline
//! - Capability traits for models, storage and the UI event stream
//!
//! # Quick Start
//!
//! ```ignore
//! use fable_core::{GenerationPipeline, PipelineConfig, PipelineServices};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn play(services: PipelineServices, config: PipelineConfig) -> anyhow::Result<()> {
//!     let pipeline = GenerationPipeline::new("my-story".into(), services);
//!
//!     // Offer to resume an interrupted turn first
//!     if let Some(restored) = pipeline.retry().restore(pipeline.story_id()).await? {
//!         pipeline.resume(restored, CancellationToken::new()).await?;
//!     }
//!
//!     let outcome = pipeline
//!         .run(1, "I step onto the ferry", config, CancellationToken::new())
//!         .await?;
//!     println!("{}", outcome.context().narrative);
//!
//!     pipeline.drain_images().await;
//!     Ok(())
//! }
//! ```

// Lets the derive macros refer to `::fable_core` from inside this crate.
extern crate self as fable_core;

pub mod capability;
pub mod context;
pub mod entry;
pub mod pipeline;
pub mod prompts;
pub mod retrieval;
pub mod retry;
pub mod structured;
pub mod telemetry;
pub mod testing;
pub mod world;

// Re-export for convenience; the trait and its derive share a name
pub use fable_macros::OutputSchema;
pub use structured::OutputSchema;

// Primary public API
pub use capability::{
    CapabilityError, ChapterEntryLookup, EventSink, GenerationProfile, GenerationRequest,
    ImageGenerator, PromptRenderer, StoreError, StoryStore, TextGenerator,
};
pub use context::{ContextBuilder, ContextBundle, ContextConfig, ContextError};
pub use entry::{EntryId, InjectionMode, KnowledgeEntry, StoryEntry, StoryId};
pub use pipeline::{
    GenerationPipeline, Phase, PipelineConfig, PipelineContext, PipelineEvent, PipelineServices,
    TurnOutcome,
};
pub use retrieval::{ActivationTracker, EntryRetrievalEngine, RetrievalConfig, RetrievalTier, Scorer};
pub use retry::{FileCheckpointStore, MemoryCheckpointStore, RetryService};
pub use world::{StateDelta, WorldSnapshot};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    /// Where the party should travel next
    #[derive(OutputSchema, Deserialize)]
    #[schema(name = "travel_plan")]
    #[allow(dead_code)]
    struct TravelPlan {
        /// Destination name
        destination: String,
        /// Days on the road
        days: u32,
        #[schema(rename = "why")]
        reason: Option<String>,
        /// Stops along the way
        #[schema(nested)]
        stops: Vec<Stop>,
    }

    #[derive(OutputSchema, Deserialize)]
    #[allow(dead_code)]
    struct Stop {
        name: String,
        #[schema(optional)]
        note: String,
    }

    #[test]
    fn test_output_schema_derive() {
        assert_eq!(TravelPlan::schema_name(), "travel_plan");
        assert_eq!(TravelPlan::schema_description(), "Where the party should travel next");

        let schema = TravelPlan::output_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["properties"]["destination"]["type"], "string");
        assert_eq!(schema["properties"]["destination"]["description"], "Destination name");
        assert_eq!(schema["properties"]["days"]["type"], "integer");
        assert_eq!(schema["properties"]["why"]["type"], "string");
        assert_eq!(schema["properties"]["stops"]["items"]["properties"]["name"]["type"], "string");

        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, vec!["destination", "days", "stops"]);
    }

    #[test]
    fn test_nested_optional_field() {
        assert_eq!(Stop::schema_name(), "stop");
        let schema = Stop::output_schema();
        assert_eq!(schema["required"], serde_json::json!(["name"]));
    }
}
