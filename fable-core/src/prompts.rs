//! Built-in prompt templates and the default renderer.
//!
//! Templates use `{{name}}` placeholders. A placeholder with no matching
//! variable is an error rather than an empty string, so a missing input
//! never silently produces a degraded prompt.

use crate::capability::{PromptRenderer, RenderError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identifies a prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    NarrativeSystem,
    Classification,
    Rerank,
    Translation,
    ScenePlanning,
    Suggestions,
}

impl TemplateId {
    pub const ALL: [TemplateId; 6] = [
        TemplateId::NarrativeSystem,
        TemplateId::Classification,
        TemplateId::Rerank,
        TemplateId::Translation,
        TemplateId::ScenePlanning,
        TemplateId::Suggestions,
    ];

    fn builtin(self) -> &'static str {
        match self {
            TemplateId::NarrativeSystem => include_str!("prompts/narrative_system.txt"),
            TemplateId::Classification => include_str!("prompts/classification.txt"),
            TemplateId::Rerank => include_str!("prompts/rerank.txt"),
            TemplateId::Translation => include_str!("prompts/translation.txt"),
            TemplateId::ScenePlanning => include_str!("prompts/scene_planning.txt"),
            TemplateId::Suggestions => include_str!("prompts/suggestions.txt"),
        }
    }
}

/// Variables substituted into a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptVars(BTreeMap<String, String>);

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Renders the built-in templates, optionally overridden per id.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates: HashMap<TemplateId, String>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// A renderer loaded with every built-in template.
    pub fn new() -> Self {
        let templates = TemplateId::ALL
            .iter()
            .map(|id| (*id, id.builtin().to_string()))
            .collect();
        Self { templates }
    }

    /// A renderer with no templates at all.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Replace one template.
    pub fn with_template(mut self, id: TemplateId, template: impl Into<String>) -> Self {
        self.templates.insert(id, template.into());
        self
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(&self, template: TemplateId, vars: &PromptVars) -> Result<String, RenderError> {
        let source = self
            .templates
            .get(&template)
            .ok_or(RenderError::UnknownTemplate(template))?;
        substitute(template, source, vars)
    }
}

fn substitute(id: TemplateId, source: &str, vars: &PromptVars) -> Result<String, RenderError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);

        let name = rest[open + 2..open + 2 + close].trim();
        let value = vars.get(name).ok_or_else(|| RenderError::MissingVariable {
            template: id,
            variable: name.to_string(),
        })?;
        out.push_str(value);

        rest = &rest[open + 2 + close + 2..];
    }

    out.push_str(rest);
    Ok(out.trim_end().to_string())
}
