//! GPS points source: reads GPX waypoint files into point records.
//!
//! When a dependency is configured, each point is additionally annotated
//! with whether its `area` field names a record of that dependency's
//! payload. Matching is exact; fuzzy reconciliation belongs to downstream
//! consumers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cragdata_common::{Diagnostic, ErrorCategory, ProcessingError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::source::{ParseOutput, Source, SourceContext, ValidateOutput};

/// Settings for [`GpsPointsSource`]
#[derive(Debug, Clone, Deserialize)]
pub struct GpsPointsConfig {
    /// GPX file to read
    pub path: PathBuf,

    /// Dependency whose record names the points' `area` fields are checked
    /// against. Must be declared in the definition's dependency list.
    #[serde(default)]
    pub match_dependency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Gpx {
    #[serde(rename = "wpt", default)]
    waypoints: Vec<Waypoint>,
}

/// One `<wpt>` element. Coordinates stay strings here; numeric conversion
/// is a per-waypoint concern so one bad point never fails the file.
#[derive(Debug, Deserialize)]
struct Waypoint {
    #[serde(rename = "@lat")]
    lat: String,
    #[serde(rename = "@lon")]
    lon: String,
    name: Option<String>,
    ele: Option<String>,
    /// Our exports carry the area name in the description element
    desc: Option<String>,
}

/// Names of records across all top-level arrays of a dependency payload
fn collect_record_names(payload: &Value) -> HashSet<String> {
    let mut names = HashSet::new();
    if let Some(map) = payload.as_object() {
        for value in map.values() {
            if let Some(records) = value.as_array() {
                for record in records {
                    if let Some(name) = record.get("name").and_then(Value::as_str) {
                        names.insert(name.to_string());
                    }
                }
            }
        }
    }
    names
}

/// Reads GPX waypoints, validates coordinate bounds, and optionally
/// annotates points against a dependency's record names.
pub struct GpsPointsSource {
    context: SourceContext,
    config: GpsPointsConfig,
}

impl GpsPointsSource {
    pub fn from_context(context: SourceContext) -> Result<Self, ProcessingError> {
        let config: GpsPointsConfig = context.typed_config()?;
        if let Some(dep) = &config.match_dependency {
            if !context.dependencies.contains_key(dep) {
                return Err(ProcessingError::config(
                    &context.name,
                    format!("match_dependency '{dep}' is not a declared dependency"),
                ));
            }
        }
        Ok(Self { context, config })
    }
}

#[async_trait]
impl Source for GpsPointsSource {
    fn type_name(&self) -> &'static str {
        "gps_points"
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
        let source_name = self.context.name.as_str();
        let text = std::str::from_utf8(raw).context("GPX file is not UTF-8")?;
        let gpx: Gpx = quick_xml::de::from_str(text).context("parsing GPX document")?;

        let mut diagnostics = Vec::new();
        let mut records = Vec::new();
        for (index, waypoint) in gpx.waypoints.into_iter().enumerate() {
            let coords = (
                waypoint.lat.trim().parse::<f64>(),
                waypoint.lon.trim().parse::<f64>(),
            );
            let (lat, lon) = match coords {
                (Ok(lat), Ok(lon)) => (lat, lon),
                _ => {
                    diagnostics.push(
                        Diagnostic::error(
                            ErrorCategory::ParseError,
                            source_name,
                            format!("waypoint {index} has non-numeric coordinates"),
                        )
                        .with_context(json!({ "lat": waypoint.lat, "lon": waypoint.lon })),
                    );
                    continue;
                }
            };

            let mut record = serde_json::Map::new();
            record.insert(
                "name".to_string(),
                json!(waypoint.name.unwrap_or_default()),
            );
            record.insert("lat".to_string(), json!(lat));
            record.insert("lon".to_string(), json!(lon));
            if let Some(area) = waypoint.desc {
                record.insert("area".to_string(), json!(area));
            }
            if let Some(raw_ele) = waypoint.ele {
                match raw_ele.trim().parse::<f64>() {
                    Ok(ele) => {
                        record.insert("elevation".to_string(), json!(ele));
                    }
                    Err(_) => diagnostics.push(Diagnostic::warning(
                        ErrorCategory::ParseError,
                        source_name,
                        format!("waypoint {index} has non-numeric elevation '{raw_ele}'"),
                    )),
                }
            }
            records.push(Value::Object(record));
        }

        let payload = json!({
            "records": records,
            "metadata": {
                "source_files": [self.config.path.display().to_string()],
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

        // Annotation is skipped entirely when the dependency was skipped or
        // failed; absent data is not this source's error.
        let known_areas: Option<HashSet<String>> = self
            .config
            .match_dependency
            .as_deref()
            .and_then(|dep| self.context.dependency_payload(dep))
            .map(collect_record_names);

        let records = match payload.get_mut("records").and_then(Value::as_array_mut) {
            Some(records) => records,
            None => anyhow::bail!("payload is missing the 'records' array"),
        };

        let mut kept = Vec::with_capacity(records.len());
        for mut record in records.drain(..) {
            total_validated += 1;

            let point_name = record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if point_name.is_empty() {
                diagnostics.push(
                    Diagnostic::error(
                        ErrorCategory::ValidationError,
                        source_name,
                        "waypoint has no name",
                    )
                    .with_context(json!({ "record": record })),
                );
                continue;
            }

            let lat = record.get("lat").and_then(Value::as_f64).unwrap_or(f64::NAN);
            let lon = record.get("lon").and_then(Value::as_f64).unwrap_or(f64::NAN);
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                diagnostics.push(
                    Diagnostic::error(
                        ErrorCategory::ValidationError,
                        source_name,
                        format!("waypoint '{point_name}' is outside coordinate bounds"),
                    )
                    .with_context(json!({ "lat": lat, "lon": lon })),
                );
                continue;
            }

            if let Some(known) = &known_areas {
                let area = record.get("area").and_then(Value::as_str).unwrap_or("");
                let matched = !area.is_empty() && known.contains(area);
                if !matched {
                    diagnostics.push(Diagnostic::warning(
                        ErrorCategory::ValidationError,
                        source_name,
                        format!("waypoint '{point_name}' names no known area"),
                    ));
                }
                if let Some(map) = record.as_object_mut() {
                    map.insert("area_matched".to_string(), Value::Bool(matched));
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cragdata_common::{DiagnosticKind, ProcessingResult};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="cragdata">
  <wpt lat="47.0998" lon="13.5412">
    <name>Hightor North</name>
    <ele>2101.5</ele>
    <desc>Hightor</desc>
  </wpt>
  <wpt lat="91.5" lon="13.0"><name>Too Far North</name></wpt>
  <wpt lat="abc" lon="13.0"><name>Scrambled</name></wpt>
  <wpt lat="47.2" lon="13.6"><desc>Hightor</desc></wpt>
</gpx>"#;

    fn source(match_dependency: Option<&str>, deps: BTreeMap<String, Arc<ProcessingResult>>) -> GpsPointsSource {
        let mut config = serde_json::Map::new();
        config.insert("path".to_string(), json!("tracks/points.gpx"));
        if let Some(dep) = match_dependency {
            config.insert("match_dependency".to_string(), json!(dep));
        }
        let context = SourceContext::new("gps", config, deps);
        GpsPointsSource::from_context(context).unwrap()
    }

    fn areas_result(names: &[&str]) -> Arc<ProcessingResult> {
        let records: Vec<Value> = names.iter().map(|name| json!({ "name": name })).collect();
        Arc::new(ProcessingResult::completed(
            "areas",
            json!({ "records": records }),
            Utc::now(),
            0,
            false,
        ))
    }

    #[test]
    fn undeclared_match_dependency_is_config_error() {
        let mut config = serde_json::Map::new();
        config.insert("path".to_string(), json!("tracks/points.gpx"));
        config.insert("match_dependency".to_string(), json!("areas"));
        let context = SourceContext::new("gps", config, BTreeMap::new());

        let err = GpsPointsSource::from_context(context).unwrap_err();
        assert_eq!(err.category, ErrorCategory::ConfigError);
    }

    #[test]
    fn parses_waypoints_and_drops_non_numeric_coordinates() {
        let source = source(None, BTreeMap::new());
        let parsed = source.parse(GPX.as_bytes()).unwrap();

        let records = parsed.payload.get("records").unwrap().as_array().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("name").unwrap(), "Hightor North");
        assert_eq!(records[0].get("elevation").unwrap(), 2101.5);
        assert_eq!(records[0].get("area").unwrap(), "Hightor");

        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.diagnostics[0].category, ErrorCategory::ParseError);
    }

    #[test]
    fn validation_enforces_bounds_and_names() {
        let source = source(None, BTreeMap::new());
        let parsed = source.parse(GPX.as_bytes()).unwrap();
        let validated = source.validate(parsed.payload).unwrap();

        // "Too Far North" is out of bounds, the nameless point is dropped.
        let records = validated.payload.get("records").unwrap().as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(validated.total_validated, 3);
        assert_eq!(
            validated
                .diagnostics
                .iter()
                .filter(|d| d.kind == DiagnosticKind::Error)
                .count(),
            2
        );
    }

    #[test]
    fn annotates_points_against_dependency_names() {
        let mut deps = BTreeMap::new();
        deps.insert("areas".to_string(), areas_result(&["Hightor"]));
        let source = source(Some("areas"), deps);

        let payload = json!({
            "records": [
                {"name": "North Face", "lat": 47.1, "lon": 13.5, "area": "Hightor"},
                {"name": "Lost Block", "lat": 47.2, "lon": 13.6, "area": "Atlantis"}
            ],
            "metadata": {}
        });
        let validated = source.validate(payload).unwrap();

        let records = validated.payload.get("records").unwrap().as_array().unwrap();
        assert_eq!(records[0].get("area_matched").unwrap(), &Value::Bool(true));
        assert_eq!(records[1].get("area_matched").unwrap(), &Value::Bool(false));
        assert_eq!(validated.diagnostics.len(), 1);
        assert_eq!(validated.diagnostics[0].kind, DiagnosticKind::Warning);
    }

    #[test]
    fn skipped_dependency_disables_annotation() {
        let mut deps = BTreeMap::new();
        deps.insert(
            "areas".to_string(),
            Arc::new(ProcessingResult::skipped("areas")),
        );
        let source = source(Some("areas"), deps);

        let payload = json!({
            "records": [{"name": "North Face", "lat": 47.1, "lon": 13.5}],
            "metadata": {}
        });
        let validated = source.validate(payload).unwrap();

        let records = validated.payload.get("records").unwrap().as_array().unwrap();
        assert!(records[0].get("area_matched").is_none());
        assert!(validated.diagnostics.is_empty());
    }
}
