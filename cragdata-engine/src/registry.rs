//! Source registry: explicit kind-to-factory wiring, resolved at startup.
//!
//! Definitions select an implementation by `kind` (defaulting to the
//! definition name). Unknown kinds are a startup failure, not a processing
//! failure.

use cragdata_common::{ProcessingError, SourceDefinition};
use std::collections::HashMap;

use crate::source::{Source, SourceContext};
use crate::sources::{GpsPointsSource, GradeTableSource, JsonExportSource};

/// Constructor for one source kind. Construction parses the typed config,
/// so invalid settings fail before any fetch is attempted.
pub type SourceFactory =
    Box<dyn Fn(SourceContext) -> Result<Box<dyn Source>, ProcessingError> + Send + Sync>;

/// Maps definition kinds to source constructors
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// Registry with no kinds registered
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in source kinds
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("json_export", |context| {
            Ok(Box::new(JsonExportSource::from_context(context)?) as Box<dyn Source>)
        });
        registry.register("grade_table", |context| {
            Ok(Box::new(GradeTableSource::from_context(context)?) as Box<dyn Source>)
        });
        registry.register("gps_points", |context| {
            Ok(Box::new(GpsPointsSource::from_context(context)?) as Box<dyn Source>)
        });
        registry
    }

    /// Register a kind, replacing any previous factory under that name
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(SourceContext) -> Result<Box<dyn Source>, ProcessingError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Instantiate the source for `definition` with the given context
    pub fn instantiate(
        &self,
        definition: &SourceDefinition,
        context: SourceContext,
    ) -> Result<Box<dyn Source>, ProcessingError> {
        let kind = definition.factory_kind();
        let factory = self.factories.get(kind).ok_or_else(|| {
            ProcessingError::config(
                &definition.name,
                format!("unknown source kind '{kind}'"),
            )
        })?;
        factory(context)
    }

    /// Check that every definition resolves to a registered kind
    pub fn check_definitions(
        &self,
        definitions: &[SourceDefinition],
    ) -> Result<(), ProcessingError> {
        for definition in definitions {
            let kind = definition.factory_kind();
            if !self.contains(kind) {
                return Err(ProcessingError::config(
                    &definition.name,
                    format!("unknown source kind '{kind}'"),
                ));
            }
        }
        Ok(())
    }
}
