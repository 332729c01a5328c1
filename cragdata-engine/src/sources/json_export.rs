//! JSON export source: reads an export file and normalizes it into record
//! arrays.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cragdata_common::{Diagnostic, ErrorCategory, ProcessingError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::source::{ParseOutput, Source, SourceContext, ValidateOutput};

/// Settings for [`JsonExportSource`]
#[derive(Debug, Clone, Deserialize)]
pub struct JsonExportConfig {
    /// Export file to read
    pub path: PathBuf,

    /// Payload field the records land under
    #[serde(default = "default_records_field")]
    pub records_field: String,

    /// Optional record fields whose absence is reported as a warning
    #[serde(default)]
    pub expected_fields: Vec<String>,
}

fn default_records_field() -> String {
    "records".to_string()
}

/// Reads a JSON export file. The top level must be an array of records or
/// an object of record arrays; anything else fails the parse. Records
/// without a usable `name` are dropped during validation.
pub struct JsonExportSource {
    context: SourceContext,
    config: JsonExportConfig,
}

impl JsonExportSource {
    pub fn from_context(context: SourceContext) -> Result<Self, ProcessingError> {
        let config = context.typed_config()?;
        Ok(Self { context, config })
    }
}

#[async_trait]
impl Source for JsonExportSource {
    fn type_name(&self) -> &'static str {
        "json_export"
    }

    fn context(&self) -> &SourceContext {
        &self.context
    }

    fn source_files(&self) -> Vec<PathBuf> {
        vec![self.config.path.clone()]
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let raw = tokio::fs::read(&self.config.path)
            .await
            .with_context(|| format!("failed to read {}", self.config.path.display()))?;
        Ok(raw)
    }

    fn parse(&self, raw: &[u8]) -> Result<ParseOutput> {
        let document: Value =
            serde_json::from_slice(raw).context("export is not valid JSON")?;

        let records = match document {
            Value::Array(records) => records,
            Value::Object(map) => {
                // An object of arrays flattens in key order.
                let mut records = Vec::new();
                for (field, value) in map {
                    match value {
                        Value::Array(chunk) => records.extend(chunk),
                        _ => anyhow::bail!("export field '{field}' is not an array"),
                    }
                }
                records
            }
            _ => anyhow::bail!("export top level must be an array or an object of arrays"),
        };

        let mut payload = serde_json::Map::new();
        payload.insert(self.config.records_field.clone(), Value::Array(records));
        payload.insert(
            "metadata".to_string(),
            json!({
                "source_files": [self.config.path.display().to_string()],
            }),
        );

        Ok(ParseOutput {
            payload: Value::Object(payload),
            diagnostics: Vec::new(),
        })
    }

    fn validate(&self, payload: Value) -> Result<ValidateOutput> {
        let mut payload = payload;
        let source_name = self.context.name.as_str();
        let records_field = self.config.records_field.as_str();
        let mut diagnostics = Vec::new();
        let mut total_validated = 0usize;

        let records = match payload
            .get_mut(records_field)
            .and_then(Value::as_array_mut)
        {
            Some(records) => records,
            None => anyhow::bail!("payload is missing the '{records_field}' array"),
        };

        let mut kept = Vec::with_capacity(records.len());
        for record in records.drain(..) {
            total_validated += 1;

            let record_name = record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if record_name.is_empty() {
                diagnostics.push(
                    Diagnostic::error(
                        ErrorCategory::ValidationError,
                        source_name,
                        "record has no usable 'name'",
                    )
                    .with_context(json!({ "record": record })),
                );
                continue;
            }

            for field in &self.config.expected_fields {
                if record.get(field).is_none() {
                    diagnostics.push(Diagnostic::warning(
                        ErrorCategory::ValidationError,
                        source_name,
                        format!("record '{record_name}' is missing expected field '{field}'"),
                    ));
                }
            }

            kept.push(record);
        }
        *records = kept;

        Ok(ValidateOutput {
            payload,
            diagnostics,
            total_validated,
        })
    }
}
