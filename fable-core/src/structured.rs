//! Structured extraction: schema-constrained model output.
//!
//! A malformed reply gets exactly one repair attempt in which the model is
//! told why its reply was rejected. If the repair also fails, the
//! `MalformedOutput` error is returned and the calling phase decides how
//! to degrade.

use crate::capability::{CapabilityError, ChatMessage, GenerationRequest, TextGenerator};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A type the model can be asked to produce.
///
/// Usually derived with `#[derive(OutputSchema)]`.
pub trait OutputSchema {
    fn schema_name() -> &'static str;
    fn schema_description() -> &'static str;
    fn output_schema() -> serde_json::Value;
}

/// Ask for a `T`, repairing a malformed reply once.
pub async fn extract<T>(
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    cancel: &CancellationToken,
) -> Result<T, CapabilityError>
where
    T: OutputSchema + DeserializeOwned,
{
    let request = request.with_schema(T::output_schema());

    match attempt::<T>(generator, request.clone(), cancel).await {
        Err(CapabilityError::MalformedOutput(reason)) => {
            warn!(schema = T::schema_name(), %reason, "Malformed structured output, requesting repair");
            attempt::<T>(generator, repair_request::<T>(request, &reason), cancel).await
        }
        other => other,
    }
}

async fn attempt<T: DeserializeOwned>(
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    cancel: &CancellationToken,
) -> Result<T, CapabilityError> {
    let value = generator.generate_structured(request, cancel).await?;
    serde_json::from_value(value).map_err(|e| CapabilityError::MalformedOutput(e.to_string()))
}

fn repair_request<T: OutputSchema>(mut request: GenerationRequest, reason: &str) -> GenerationRequest {
    let schema = T::output_schema();
    request.messages.push(ChatMessage::user(format!(
        "Your previous reply could not be used: {reason}\n\
         Reply again with ONLY a JSON object (no markdown, no commentary) matching this schema for `{}`:\n{schema}",
        T::schema_name()
    )));
    request
}

/// Parse the JSON value contained in a model reply.
pub fn parse_json_value(text: &str) -> Result<serde_json::Value, CapabilityError> {
    let json_str = extract_json(text);
    serde_json::from_str(json_str).map_err(|e| {
        let preview: String = json_str.chars().take(120).collect();
        CapabilityError::MalformedOutput(format!("{e}: {preview}"))
    })
}

/// Extract JSON from a reply that might be wrapped in markdown or prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // ``` ... ``` blocks
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Prose around a bare object
    if !text.starts_with('{') {
        if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
            if start < end {
                return &text[start..=end];
            }
        }
    }

    text
}
