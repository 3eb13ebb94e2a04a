//! End-to-end turns through the generation pipeline.
//!
//! Every capability is scripted through `TestHarness`, so these run
//! offline and deterministically.
//!
//! Run with: `cargo test -p fable-core --test pipeline_flow`

use async_trait::async_trait;
use fable_core::capability::{CapabilityError, ChapterEntryLookup, StoreError};
use fable_core::entry::{InjectionMode, KnowledgeEntry, StoryEntry, StoryId};
use fable_core::pipeline::{ConfigError, Phase, PhaseError, PipelineEvent, TurnOutcome};
use fable_core::testing::{
    assert_done, assert_phases, CancelTrigger, MockImageGenerator, StreamScript, TestHarness,
    CLASSIFICATION_PROMPT, RERANK_PROMPT, SCENE_PROMPT, SUGGESTIONS_PROMPT, TRANSLATION_PROMPT,
};
use fable_core::world::WorldSnapshot;
use fable_core::GenerationPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STORY: &str = "ferry";

const QUIET_TURN: [Phase; 5] = [
    Phase::PreGeneration,
    Phase::Retrieval,
    Phase::Narrative,
    Phase::Classification,
    Phase::PostGeneration,
];

/// History lookup that never answers.
struct StalledHistory;

#[async_trait]
impl ChapterEntryLookup for StalledHistory {
    async fn recent_entries(&self, _story_id: &StoryId, _limit: usize) -> Result<Vec<StoryEntry>, StoreError> {
        std::future::pending().await
    }
}

fn seed_entries(harness: &TestHarness) {
    harness.store.add_entry(KnowledgeEntry::new(
        "The Crossing",
        "A grey river that never freezes.",
        InjectionMode::Always,
    ));
    harness.store.add_entry(
        KnowledgeEntry::new("Mara", "The ferrywoman. Owes the reader a favor.", InjectionMode::KeywordTriggered)
            .with_keywords(["ferrywoman"]),
    );
    harness.store.add_entry(KnowledgeEntry::new(
        "Salt Guild",
        "Merchants who run the southern docks.",
        InjectionMode::RelevanceRanked,
    ));
}

// =============================================================================
// HAPPY PATH
// =============================================================================

#[tokio::test]
async fn test_full_turn_reaches_done() {
    let harness = TestHarness::scripted(&["The fog ", "lifts over ", "the water."]);
    seed_entries(&harness);
    harness.store.set_world(WorldSnapshot::new().with_location("The Crossing"));

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I ask the ferrywoman about the fog", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    let ctx = match outcome {
        TurnOutcome::Completed(ctx) => ctx,
        other => panic!("Expected a completed turn, got {other:?}"),
    };

    assert_phases(&harness.sink, &QUIET_TURN);
    assert_done(&harness.sink);

    assert_eq!(ctx.phase, Phase::Done);
    assert_eq!(ctx.narrative, "The fog lifts over the water.");
    assert_eq!(ctx.narrative, harness.sink.narrative());
    assert_eq!(ctx.suggestions, vec!["I wait", "I leave"]);

    let tier1: Vec<&str> = ctx.bundle.tier1.iter().map(|e| e.name.as_str()).collect();
    let tier2: Vec<&str> = ctx.bundle.tier2.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(tier1, vec!["The Crossing"]);
    assert_eq!(tier2, vec!["Mara"]);
    assert!(ctx.bundle.tier3.is_empty());
    assert!(ctx.bundle.rendered.contains("The ferrywoman."));

    // The unmatched relevance-ranked entry went to the reranker
    assert_eq!(harness.generator.requests_matching(RERANK_PROMPT), 1);

    // History gets the action and the narration; the checkpoint is gone
    assert_eq!(harness.store.history().len(), 2);
    assert!(!harness.checkpoints.contains(&STORY.into()).await);
}

#[tokio::test]
async fn test_narrative_prompt_carries_context_and_history() {
    let harness = TestHarness::scripted(&["The rope holds."]);
    seed_entries(&harness);
    harness.store.push_history(StoryEntry::user_action("I board the ferry"));
    harness.store.push_history(StoryEntry::narration("Mara nods and pushes off."));

    let pipeline = harness.pipeline(STORY);
    pipeline
        .run(2, "I grab the rope", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    let narrative = harness
        .generator
        .requests()
        .into_iter()
        .find(|r| r.system.contains("A grey river that never freezes."))
        .expect("narrative request");
    let contents: Vec<&str> = narrative.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["I board the ferry", "Mara nods and pushes off.", "I grab the rope"]);

    // Mara was in the recent window, so she made it into context too
    assert!(narrative.system.contains("[Mara]"));
}

#[tokio::test]
async fn test_classification_updates_world() {
    let harness = TestHarness::new();
    harness.generator.push_stream(StreamScript::chunks(["Mara steps aboard, lantern in hand."]));
    harness.generator.respond_when(
        CLASSIFICATION_PROMPT,
        r#"{"deltas": [
            {"type": "character_entered", "name": "Mara"},
            {"type": "item_gained", "item": "lantern"}
        ]}"#,
    );
    harness
        .generator
        .respond_when(SUGGESTIONS_PROMPT, r#"{"suggestions": ["I light the lantern"]}"#);

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I wave Mara over", harness.config(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let ctx = outcome.context();
    assert_eq!(ctx.deltas.len(), 2);
    assert_eq!(ctx.world.present_characters, vec!["Mara"]);
    assert_eq!(harness.store.world().inventory, vec!["lantern"]);
    assert_eq!(harness.store.updates().len(), 1);

    let degraded = harness.sink.count(|e| {
        matches!(e, PipelineEvent::ClassificationComplete { degraded: Some(_), .. })
    });
    assert_eq!(degraded, 0);
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[tokio::test]
async fn test_cancel_mid_narrative_aborts_with_partial_text() {
    let harness = TestHarness::scripted(&["One ", "two ", "three ", "four"]);
    let cancel = CancellationToken::new();
    harness.sink.cancel_on(CancelTrigger::Chunks(2), cancel.clone());

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I count the oars", harness.config(), cancel)
        .await
        .unwrap();

    let (phase, context) = match outcome {
        TurnOutcome::Aborted { phase, context } => (phase, context),
        other => panic!("Expected an aborted turn, got {other:?}"),
    };
    assert_eq!(phase, Phase::Narrative);
    assert_eq!(context.narrative, "One two ");
    assert_eq!(context.narrative, harness.sink.narrative());

    // Nothing starts after the cancelled phase, and Aborted is the last word
    assert_phases(&harness.sink, &[Phase::PreGeneration, Phase::Retrieval, Phase::Narrative]);
    match harness.sink.last() {
        Some(PipelineEvent::Aborted { phase, context }) => {
            assert_eq!(phase, Phase::Narrative);
            assert_eq!(context.narrative, "One two ");
        }
        other => panic!("Expected Aborted last, got {other:?}"),
    }
    assert_eq!(harness.sink.count(|e| e.is_terminal()), 1);

    // No history for an unfinished narrative; the checkpoint stays for a retry
    assert!(harness.store.history().is_empty());
    assert!(harness.checkpoints.contains(&STORY.into()).await);
}

#[tokio::test]
async fn test_cancel_before_start_runs_nothing() {
    let harness = TestHarness::scripted(&["unused"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline.run(1, "I wait", harness.config(), cancel).await.unwrap();

    assert!(matches!(outcome, TurnOutcome::Aborted { phase: Phase::PreGeneration, .. }));
    assert!(harness.sink.started_phases().is_empty());
    assert!(harness.generator.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_loading_aborts_pre_generation() {
    let harness = TestHarness::scripted(&["never streamed"]);
    let mut services = harness.services();
    services.chapters = Arc::new(StalledHistory);
    let pipeline = GenerationPipeline::new(STORY.into(), services);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let outcome = pipeline
        .run(1, "I wait by the water", harness.config(), cancel)
        .await
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Aborted { phase: Phase::PreGeneration, .. }));
    assert_eq!(harness.sink.started_phases(), vec![Phase::PreGeneration]);
    assert!(harness.generator.requests().is_empty());
    assert_eq!(harness.generator.stream_calls(), 0);
}

// =============================================================================
// DEGRADATION AND RETRIES
// =============================================================================

#[tokio::test]
async fn test_malformed_classification_degrades_and_still_finishes() {
    let harness = TestHarness::new();
    harness.generator.push_stream(StreamScript::chunks(["The river churns."]));
    harness.generator.respond_when(CLASSIFICATION_PROMPT, "this is not json");
    harness
        .generator
        .respond_when(SUGGESTIONS_PROMPT, r#"{"suggestions": ["I hold on"]}"#);

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I hold on", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_done(&harness.sink);

    // The original request plus one repair attempt
    assert_eq!(harness.generator.requests_matching(CLASSIFICATION_PROMPT), 2);

    let classified: Vec<PipelineEvent> = harness
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::ClassificationComplete { .. }))
        .collect();
    assert_eq!(classified.len(), 1);
    match &classified[0] {
        PipelineEvent::ClassificationComplete { deltas, degraded } => {
            assert!(deltas.is_empty());
            assert!(degraded.is_some());
        }
        _ => unreachable!(),
    }
    assert!(harness.store.updates().is_empty());
}

#[tokio::test]
async fn test_transient_stream_failure_is_retried_once() {
    let harness = TestHarness::new();
    harness
        .generator
        .push_stream(StreamScript::OpenError(CapabilityError::Transient("connection reset".into())));
    harness.generator.push_stream(StreamScript::chunks(["Second ", "time lucky."]));
    harness.generator.respond_when(CLASSIFICATION_PROMPT, r#"{"deltas": []}"#);
    harness
        .generator
        .respond_when(SUGGESTIONS_PROMPT, r#"{"suggestions": ["I go on"]}"#);

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I try again", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.context().narrative, "Second time lucky.");
    assert_eq!(harness.generator.stream_calls(), 2);
}

#[tokio::test]
async fn test_failure_after_text_is_not_retried() {
    let harness = TestHarness::new();
    harness.generator.push_stream(StreamScript::Items(vec![
        Ok("Half a sentence".to_string()),
        Err(CapabilityError::Transient("connection reset".into())),
    ]));
    harness.generator.push_stream(StreamScript::chunks(["never streamed"]));

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I listen", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    let (phase, error, context) = match outcome {
        TurnOutcome::Failed { phase, error, context } => (phase, error, context),
        other => panic!("Expected a failed turn, got {other:?}"),
    };
    assert_eq!(phase, Phase::Narrative);
    assert!(matches!(error, PhaseError::Capability(CapabilityError::Transient(_))));
    assert_eq!(context.narrative, "Half a sentence");
    assert_eq!(harness.generator.stream_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_narrative_timeout_is_fatal() {
    let harness = TestHarness::new();
    harness.generator.push_stream(StreamScript::Stall(vec!["Once upon".to_string()]));

    let pipeline = harness.pipeline(STORY);
    let config = harness.config().with_narrative_timeout(Duration::from_secs(5));
    let outcome = pipeline
        .run(1, "I wait for the story", config, CancellationToken::new())
        .await
        .unwrap();

    let (phase, error, context) = match outcome {
        TurnOutcome::Failed { phase, error, context } => (phase, error, context),
        other => panic!("Expected a failed turn, got {other:?}"),
    };
    assert_eq!(phase, Phase::Narrative);
    assert!(matches!(error, PhaseError::NarrativeTimeout(d) if d == Duration::from_secs(5)));
    assert_eq!(context.narrative, "Once upon");

    match harness.sink.last() {
        Some(PipelineEvent::Error { phase, cause, .. }) => {
            assert_eq!(phase, Phase::Narrative);
            assert!(!cause.is_empty());
        }
        other => panic!("Expected Error last, got {other:?}"),
    }
    assert!(harness.checkpoints.contains(&STORY.into()).await);
}

#[tokio::test]
async fn test_empty_input_fails_in_pre_generation() {
    let harness = TestHarness::scripted(&["unused"]);
    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "   ", harness.config(), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        TurnOutcome::Failed { phase: Phase::PreGeneration, error: PhaseError::EmptyInput, .. }
    ));
    assert_eq!(harness.generator.stream_calls(), 0);
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[tokio::test]
async fn test_unconfigured_phase_fails_before_any_call() {
    let harness = TestHarness::scripted(&["unused"]);
    let mut config = harness.config();
    config.models.classification = None;

    let pipeline = harness.pipeline(STORY);
    let result = pipeline.run(1, "I look around", config, CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(ConfigError::Unconfigured { phase: Phase::Classification, .. })
    ));
    assert!(harness.generator.requests().is_empty());
    assert!(harness.sink.events().is_empty());
    assert!(!harness.checkpoints.contains(&STORY.into()).await);
}

#[tokio::test]
async fn test_images_need_an_image_generator() {
    let harness = TestHarness::scripted(&["unused"]);
    let pipeline = fable_core::GenerationPipeline::new(STORY.into(), harness.services().without_images());

    let result = pipeline
        .run(1, "I look around", harness.config().with_images(1), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ConfigError::Unconfigured { phase: Phase::Image, .. })));
}

#[tokio::test]
async fn test_disabled_suggestions_skip_post_generation() {
    let harness = TestHarness::scripted(&["Quiet water."]);
    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I drift", harness.config().with_suggestions(false), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_phases(&harness.sink, &QUIET_TURN);
    assert!(outcome.context().suggestions.is_empty());
    assert_eq!(harness.generator.requests_matching(SUGGESTIONS_PROMPT), 0);
    assert_eq!(
        harness.sink.count(|e| matches!(e, PipelineEvent::SuggestionsReady { .. })),
        0
    );
}

// =============================================================================
// TRANSLATION AND IMAGES
// =============================================================================

#[tokio::test]
async fn test_translation_and_images() {
    let harness = TestHarness::scripted(&["The fog lifts."]);
    harness
        .generator
        .respond_when(TRANSLATION_PROMPT, "Der Nebel lichtet sich.");
    harness.generator.replace_when(
        SCENE_PROMPT,
        r#"{"scenes": [
            {"prompt": "A ferry in thinning fog"},
            {"prompt": "A lantern on black water"},
            {"prompt": "A third scene over the cap"}
        ]}"#,
    );

    let pipeline = harness.pipeline(STORY);
    let config = harness.config().with_translation("German").with_images(2);
    let outcome = pipeline
        .run(1, "I watch the fog", config, CancellationToken::new())
        .await
        .unwrap();
    pipeline.drain_images().await;
    assert_eq!(pipeline.pending_images().await, 0);

    assert!(outcome.is_completed());
    assert_phases(
        &harness.sink,
        &[
            Phase::PreGeneration,
            Phase::Retrieval,
            Phase::Narrative,
            Phase::Classification,
            Phase::Translation,
            Phase::Image,
            Phase::PostGeneration,
        ],
    );

    let ctx = outcome.context();
    assert_eq!(ctx.translation.as_deref(), Some("Der Nebel lichtet sich."));
    assert_eq!(
        harness.sink.count(|e| matches!(
            e,
            PipelineEvent::TranslationComplete { language, .. } if language == "German"
        )),
        1
    );

    // Capped at two scenes, each reported once it is ready
    let prompts: Vec<&str> = ctx.image_queue.iter().map(|q| q.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["A ferry in thinning fog", "A lantern on black water"]);
    assert_eq!(harness.sink.count(|e| matches!(e, PipelineEvent::ImageQueued { .. })), 2);
    assert_eq!(harness.sink.count(|e| matches!(e, PipelineEvent::ImageReady { .. })), 2);
    assert_eq!(harness.images.prompts().len(), 2);
}

#[tokio::test]
async fn test_finished_image_tasks_do_not_pile_up_across_turns() {
    let harness = TestHarness::scripted(&["The fog lifts."]);
    harness.generator.replace_when(
        SCENE_PROMPT,
        r#"{"scenes": [{"prompt": "A ferry in thinning fog"}, {"prompt": "A lantern on black water"}]}"#,
    );
    let pipeline = harness.pipeline(STORY);

    for turn in 1..=3 {
        let outcome = pipeline
            .run(turn, "I watch the fog", harness.config().with_images(2), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());

        // Let this turn's images finish without draining them
        let ready = 2 * turn as usize;
        while harness.sink.count(|e| matches!(e, PipelineEvent::ImageReady { .. })) < ready {
            tokio::task::yield_now().await;
        }
        assert!(pipeline.pending_images().await <= 2, "turn {turn}");
    }

    pipeline.drain_images().await;
    assert_eq!(pipeline.pending_images().await, 0);
    assert_eq!(harness.images.prompts().len(), 6);
}

#[tokio::test]
async fn test_failed_images_do_not_fail_the_turn() {
    let mut harness = TestHarness::scripted(&["The fog lifts."]);
    harness.images = Arc::new(MockImageGenerator::failing(CapabilityError::Unavailable(
        "quota exhausted".into(),
    )));
    harness
        .generator
        .replace_when(SCENE_PROMPT, r#"{"scenes": [{"prompt": "A ferry in thinning fog"}]}"#);

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I watch the fog", harness.config().with_images(1), CancellationToken::new())
        .await
        .unwrap();
    pipeline.drain_images().await;

    assert!(outcome.is_completed());
    assert_done(&harness.sink);
    assert_eq!(outcome.context().image_queue.len(), 1);
    assert_eq!(
        harness.sink.count(|e| matches!(e, PipelineEvent::ImageFailed { scene_index: 0, .. })),
        1
    );
    assert_eq!(harness.sink.count(|e| matches!(e, PipelineEvent::ImageReady { .. })), 0);
}

#[tokio::test]
async fn test_failed_scene_planning_queues_nothing() {
    let harness = TestHarness::scripted(&["The fog lifts."]);
    harness.generator.replace_when(SCENE_PROMPT, "no scenes, sorry");

    let pipeline = harness.pipeline(STORY);
    let outcome = pipeline
        .run(1, "I watch the fog", harness.config().with_images(2), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.context().image_queue.is_empty());
    assert_eq!(pipeline.pending_images().await, 0);
}
