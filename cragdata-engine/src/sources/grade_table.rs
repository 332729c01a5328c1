//! Grade table source: extracts rows from one HTML table in a scraped page.
//!
//! Scanning is deliberately local and case-insensitive: find the wanted
//! `<table>` block, walk its `<tr>` blocks, clean each cell. Page-specific
//! selector precedence stays out of the engine; this source only maps cells
//! onto configured column names. Nested tables are not supported; the first
//! closing tag ends a block.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cragdata_common::{Diagnostic, ErrorCategory, ProcessingError};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::source::{ParseOutput, Source, SourceContext, ValidateOutput};

/// Settings for [`GradeTableSource`]
#[derive(Debug, Clone, Deserialize)]
pub struct GradeTableConfig {
    /// File path or http(s) URL of the HTML document
    pub location: String,

    /// Which table in the document holds the rows
    #[serde(default)]
    pub table_index: usize,

    /// Column names mapped onto cells positionally; all are required
    /// non-empty at validation
    pub columns: Vec<String>,

    /// Skip the first row as a header
    #[serde(default = "default_has_header")]
    pub has_header: bool,
}

fn default_has_header() -> bool {
    true
}

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Byte ranges of `<tag ...>...</tag>` bodies, scanned case-insensitively.
/// Unclosed blocks are ignored.
fn tag_blocks(html: &str, tag: &str) -> Vec<(usize, usize)> {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find(&open) {
        let start = cursor + found;
        // Reject prefixes of longer tag names (e.g. <tablet).
        match lower.as_bytes().get(start + open.len()).copied() {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'/') => {}
            _ => {
                cursor = start + open.len();
                continue;
            }
        }

        let body_start = match lower[start..].find('>') {
            Some(offset) => start + offset + 1,
            None => break,
        };
        let body_end = match lower[body_start..].find(&close) {
            Some(offset) => body_start + offset,
            None => break,
        };
        blocks.push((body_start, body_end));

        cursor = match lower[body_end..].find('>') {
            Some(offset) => body_end + offset + 1,
            None => break,
        };
    }

    blocks
}

/// Tag stripping, entity decoding, and whitespace collapse for one cell
fn clean_cell(cell: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());

    let stripped = re_tags.replace_all(cell, " ");
    let decoded = html_escape::decode_html_entities(stripped.as_ref());
    let collapsed = re_ws.replace_all(decoded.as_ref(), " ");
    collapsed.trim().to_string()
}

/// Cell texts of one `<tr>` body, `<td>` and `<th>` alike, in order
fn row_cells(row: &str) -> Vec<String> {
    let mut cells: Vec<(usize, String)> = Vec::new();
    for tag in ["td", "th"] {
        for (start, end) in tag_blocks(row, tag) {
            cells.push((start, clean_cell(&row[start..end])));
        }
    }
    cells.sort_by_key(|(start, _)| *start);
    cells.into_iter().map(|(_, cell)| cell).collect()
}

/// Extracts the rows of one table from an HTML page (local file or URL) and
/// maps cells onto configured column names.
pub struct GradeTableSource {
    context: SourceContext,
    config: GradeTableConfig,
}

impl GradeTableSource {
    pub fn from_context(context: SourceContext) -> Result<Self, ProcessingError> {
        let config: GradeTableConfig = context.typed_config()?;
        if config.columns.is_empty() {
            return Err(ProcessingError::config(
                &context.name,
                "'columns' must name at least one column",
            ));
        }
        Ok(Self { context, config })
    }
}

#[async_trait]
impl Source for GradeTableSource {
    fn type_name(&self) -> &'static str {
        "grade_table"
    }

    fn context(&self) -> &SourceContext {
        &self.context
    }

    /// URL-backed documents have no local freshness oracle
    fn source_files(&self) -> Vec<PathBuf> {
        if is_url(&self.config.location) {
            Vec::new()
        } else {
            vec![PathBuf::from(&self.config.location)]
        }
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let location = self.config.location.as_str();
        if is_url(location) {
            let response = reqwest::get(location)
                .await
                .with_context(|| format!("request to {location} failed"))?
                .error_for_status()
                .with_context(|| format!("request to {location} rejected"))?;
            let body = response
                .bytes()
                .await
                .with_context(|| format!("reading body from {location} failed"))?;
            Ok(body.to_vec())
        } else {
            let raw = tokio::fs::read(location)
                .await
                .with_context(|| format!("failed to read {location}"))?;
            Ok(raw)
        }
    }

    fn parse(&self, raw: &[u8]) -> Result<ParseOutput> {
        let html = String::from_utf8_lossy(raw);
        let source_name = self.context.name.as_str();
        let wanted = self.config.columns.len();

        let tables = tag_blocks(&html, "table");
        let (body_start, body_end) = match tables.get(self.config.table_index) {
            Some(range) => *range,
            None => anyhow::bail!(
                "document has {} table(s), wanted index {}",
                tables.len(),
                self.config.table_index
            ),
        };
        let table = &html[body_start..body_end];

        let mut diagnostics = Vec::new();
        let mut records = Vec::new();
        let mut rows = tag_blocks(table, "tr").into_iter();
        if self.config.has_header {
            rows.next();
        }

        for (row_index, (start, end)) in rows.enumerate() {
            let cells = row_cells(&table[start..end]);
            if cells.len() < wanted {
                diagnostics.push(
                    Diagnostic::error(
                        ErrorCategory::ParseError,
                        source_name,
                        format!(
                            "row {row_index} has {} cell(s), expected {wanted}",
                            cells.len()
                        ),
                    )
                    .with_context(json!({ "row": row_index, "cells": cells })),
                );
                continue;
            }

            let mut record = serde_json::Map::new();
            for (column, cell) in self.config.columns.iter().zip(cells) {
                record.insert(column.clone(), Value::String(cell));
            }
            records.push(Value::Object(record));
        }

        let payload = json!({
            "records": records,
            "metadata": {
                "location": self.config.location,
                "table_index": self.config.table_index,
                "source_files": self.source_files()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>(),
            }
        });

        Ok(ParseOutput {
            payload,
            diagnostics,
        })
    }

    fn validate(&self, payload: Value) -> Result<ValidateOutput> {
        let mut payload = payload;
        let source_name = self.context.name.as_str();
        let mut diagnostics = Vec::new();
        let mut total_validated = 0usize;

        let records = match payload.get_mut("records").and_then(Value::as_array_mut) {
            Some(records) => records,
            None => anyhow::bail!("payload is missing the 'records' array"),
        };

        let mut kept = Vec::with_capacity(records.len());
        for record in records.drain(..) {
            total_validated += 1;

            let empty_column = self.config.columns.iter().find(|column| {
                record
                    .get(column.as_str())
                    .and_then(Value::as_str)
                    .map_or(true, |cell| cell.trim().is_empty())
            });

            match empty_column {
                Some(column) => diagnostics.push(
                    Diagnostic::error(
                        ErrorCategory::ValidationError,
                        source_name,
                        format!("required column '{column}' is empty"),
                    )
                    .with_context(json!({ "record": record })),
                ),
                None => kept.push(record),
            }
        }
        *records = kept;

        Ok(ValidateOutput {
            payload,
            diagnostics,
            total_validated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cragdata_common::DiagnosticKind;
    use std::collections::BTreeMap;

    const PAGE: &str = r#"
<html><body>
<h1>Routes at Hightor</h1>
<TABLE class="routes">
  <tr><th>Route</th><th>Grade</th><th>Stars</th></tr>
  <tr><td><a href="/r/1">Resurrection</a></td><td>7b+</td><td>***</td></tr>
  <tr><td>Flaky &amp; Loose</td><td>6a</td><td></td></tr>
  <tr><td>Broken row</td><td>5c</td></tr>
</TABLE>
</body></html>
"#;

    fn source() -> GradeTableSource {
        let mut config = serde_json::Map::new();
        config.insert("location".to_string(), json!("pages/hightor.html"));
        config.insert("columns".to_string(), json!(["name", "grade", "stars"]));
        let context = SourceContext::new("routes", config, BTreeMap::new());
        GradeTableSource::from_context(context).unwrap()
    }

    #[test]
    fn empty_columns_is_config_error() {
        let mut config = serde_json::Map::new();
        config.insert("location".to_string(), json!("pages/hightor.html"));
        config.insert("columns".to_string(), json!([]));
        let context = SourceContext::new("routes", config, BTreeMap::new());
        let err = GradeTableSource::from_context(context).unwrap_err();
        assert_eq!(err.category, ErrorCategory::ConfigError);
    }

    #[test]
    fn finds_tables_case_insensitively() {
        let blocks = tag_blocks(PAGE, "table");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn cleans_cells_of_markup_and_entities() {
        assert_eq!(
            clean_cell("<a href=\"/r/1\">Resurrection</a>"),
            "Resurrection"
        );
        assert_eq!(clean_cell("Flaky &amp;   Loose"), "Flaky & Loose");
    }

    #[test]
    fn parses_rows_and_drops_short_ones() {
        let parsed = source().parse(PAGE.as_bytes()).unwrap();

        let records = parsed.payload.get("records").unwrap().as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name").unwrap(), "Resurrection");
        assert_eq!(records[0].get("grade").unwrap(), "7b+");
        assert_eq!(records[1].get("name").unwrap(), "Flaky & Loose");

        // The three-column config rejects the two-cell row.
        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.diagnostics[0].category, ErrorCategory::ParseError);
    }

    #[test]
    fn missing_table_index_fails_parse() {
        let mut config = serde_json::Map::new();
        config.insert("location".to_string(), json!("pages/hightor.html"));
        config.insert("columns".to_string(), json!(["name"]));
        config.insert("table_index".to_string(), json!(3));
        let context = SourceContext::new("routes", config, BTreeMap::new());
        let source = GradeTableSource::from_context(context).unwrap();

        assert!(source.parse(PAGE.as_bytes()).is_err());
    }

    #[test]
    fn validation_requires_all_columns_non_empty() {
        let parsed = source().parse(PAGE.as_bytes()).unwrap();
        let validated = source().validate(parsed.payload).unwrap();

        // "Flaky & Loose" has an empty stars cell and is dropped.
        let records = validated.payload.get("records").unwrap().as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(validated.total_validated, 2);
        assert_eq!(validated.diagnostics.len(), 1);
        assert_eq!(validated.diagnostics[0].kind, DiagnosticKind::Error);
    }

    #[test]
    fn url_locations_have_no_source_files() {
        let mut config = serde_json::Map::new();
        config.insert(
            "location".to_string(),
            json!("https://example.org/routes.html"),
        );
        config.insert("columns".to_string(), json!(["name"]));
        let context = SourceContext::new("routes", config, BTreeMap::new());
        let source = GradeTableSource::from_context(context).unwrap();
        assert!(source.source_files().is_empty());
    }
}
