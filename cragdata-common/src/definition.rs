//! Source definitions: the declarative input to the engine

use crate::error::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Declarative description of one data source.
///
/// The `dependencies` lists of a definition set form a directed graph that
/// must be acyclic; the orchestrator detects cycles during resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Unique name within the definition set
    pub name: String,

    /// Factory kind selecting the implementation; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Disabled definitions short-circuit to a skipped result
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Opaque settings interpreted by the concrete source
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,

    /// Names of sources whose results this one consumes, in resolution order
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            enabled: true,
            config: serde_json::Map::new(),
            dependencies: Vec::new(),
        }
    }

    /// Kind used for factory lookup
    pub fn factory_kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Check a definition set for defects detectable before any processing:
/// duplicate names and dependencies naming undefined sources.
pub fn validate_definitions(definitions: &[SourceDefinition]) -> Result<()> {
    let mut names = HashSet::new();
    for definition in definitions {
        if !names.insert(definition.name.as_str()) {
            return Err(ProcessingError::config(
                &definition.name,
                format!("duplicate source definition '{}'", definition.name),
            ));
        }
    }

    for definition in definitions {
        for dependency in &definition.dependencies {
            if !names.contains(dependency.as_str()) {
                return Err(ProcessingError::config(
                    &definition.name,
                    format!(
                        "source '{}' depends on undefined source '{}'",
                        definition.name, dependency
                    ),
                ));
            }
        }
    }

    Ok(())
}
