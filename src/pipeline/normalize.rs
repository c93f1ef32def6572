//! Maps heterogeneous source rows onto the canonical staging schema.
//!
//! Field names are cleaned (surrounding whitespace trimmed, inner
//! whitespace replaced by `_`), values are coerced to numbers, and every
//! record is tagged with its source label and raw origin.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{MissingValuePolicy, SchemaConfig};
use crate::domain::{RawRecord, StagedRecord};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s").expect("valid whitespace regex"));

/// Canonical form of a source column name: `" fixed acidity "` -> `"fixed_acidity"`.
pub fn normalize_field_name(name: &str) -> String {
    WHITESPACE.replace_all(name.trim(), "_").into_owned()
}

/// Numeric view of a raw value: JSON numbers, or strings that parse as f64.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn coerce_score(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    coerce_number(value)
        .filter(|v| v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64)
        .map(|v| v as i64)
}

/// A row's fields under their canonical names. Two source columns that
/// clean to the same name are a schema error.
fn renamed_fields(row: &RawRecord, idx: usize) -> Result<BTreeMap<String, &Value>> {
    let mut fields = BTreeMap::new();
    let mut sources: BTreeMap<String, &str> = BTreeMap::new();
    for (name, value) in &row.fields {
        let canonical = normalize_field_name(name);
        if let Some(previous) = sources.insert(canonical.clone(), name) {
            return Err(PipelineError::Schema(format!(
                "row {idx} of '{}': columns '{previous}' and '{name}' both map to '{canonical}'",
                row.origin
            )));
        }
        fields.insert(canonical, value);
    }
    Ok(fields)
}

pub struct Normalizer {
    schema: SchemaConfig,
    missing_values: MissingValuePolicy,
}

impl Normalizer {
    pub fn new(schema: SchemaConfig, missing_values: MissingValuePolicy) -> Self {
        Self {
            schema,
            missing_values,
        }
    }

    pub fn schema(&self) -> &SchemaConfig {
        &self.schema
    }

    /// Normalize a batch. Any invalid row fails the whole batch.
    pub fn normalize(&self, rows: &[RawRecord], source_label: &str) -> Result<Vec<StagedRecord>> {
        let result = self.normalize_batch(rows, source_label);
        match &result {
            Ok(records) => metrics::normalize::batch_normalized(source_label, records.len()),
            Err(e) => {
                metrics::normalize::schema_error();
                warn!("Normalization of '{}' batch failed: {}", source_label, e);
            }
        }
        result
    }

    fn normalize_batch(&self, rows: &[RawRecord], source_label: &str) -> Result<Vec<StagedRecord>> {
        let label = source_label.trim();
        if label.is_empty() {
            return Err(PipelineError::Schema("source label is empty".to_string()));
        }

        // Per row: renamed fields, then attribute values (None = missing/invalid)
        let mut scores = Vec::with_capacity(rows.len());
        let mut values: Vec<Vec<Option<f64>>> = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let fields = renamed_fields(row, idx)?;

            let score = fields
                .get(&self.schema.score_field)
                .ok_or_else(|| {
                    PipelineError::Schema(format!(
                        "row {idx} of '{}': missing field '{}'",
                        row.origin, self.schema.score_field
                    ))
                })
                .and_then(|v| {
                    coerce_score(v).ok_or_else(|| {
                        PipelineError::Schema(format!(
                            "row {idx} of '{}': field '{}' is not an integer: {v}",
                            row.origin, self.schema.score_field
                        ))
                    })
                })?;
            scores.push(score);

            values.push(
                self.schema
                    .attributes
                    .iter()
                    .map(|attr| fields.get(attr).and_then(|v| coerce_number(v)))
                    .collect(),
            );
        }

        self.resolve_missing(rows, &mut values)?;

        let records = rows
            .iter()
            .zip(scores)
            .zip(values)
            .map(|((row, quality), vals)| StagedRecord {
                attributes: self
                    .schema
                    .attributes
                    .iter()
                    .cloned()
                    .zip(vals.into_iter().map(|v| v.unwrap_or_default()))
                    .collect(),
                quality,
                source_label: label.to_string(),
                raw_key: row.origin.clone(),
            })
            .collect::<Vec<_>>();

        debug!("Normalized {} rows with label '{}'", records.len(), label);
        Ok(records)
    }

    /// Apply the missing-value policy; afterwards every slot is `Some`.
    fn resolve_missing(&self, rows: &[RawRecord], values: &mut [Vec<Option<f64>>]) -> Result<()> {
        for (col, attr) in self.schema.attributes.iter().enumerate() {
            let missing: Vec<usize> = values
                .iter()
                .enumerate()
                .filter(|(_, vals)| vals[col].is_none())
                .map(|(i, _)| i)
                .collect();
            let Some(&first) = missing.first() else {
                continue;
            };

            match self.missing_values {
                MissingValuePolicy::Reject => {
                    return Err(PipelineError::Schema(format!(
                        "row {first} of '{}': field '{attr}' is missing or not numeric",
                        rows[first].origin
                    )));
                }
                MissingValuePolicy::FillMean => {
                    let present: Vec<f64> = values.iter().filter_map(|v| v[col]).collect();
                    if present.is_empty() {
                        return Err(PipelineError::Schema(format!(
                            "field '{attr}' has no numeric value in the batch to fill from"
                        )));
                    }
                    let mean = present.iter().sum::<f64>() / present.len() as f64;
                    for &i in &missing {
                        values[i][col] = Some(mean);
                    }
                    metrics::normalize::values_filled(missing.len());
                    debug!("Filled {} missing '{}' values with mean {}", missing.len(), attr, mean);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn schema() -> SchemaConfig {
        SchemaConfig {
            attributes: vec!["fixed_acidity".into(), "alcohol".into()],
            ..SchemaConfig::default()
        }
    }

    fn raw(v: Value) -> RawRecord {
        RawRecord::new(
            "winequality-red.csv",
            Utc::now(),
            v.as_object().unwrap().clone().into_iter().collect(),
        )
    }

    #[test]
    fn field_names_lose_whitespace() {
        assert_eq!(normalize_field_name("fixed acidity"), "fixed_acidity");
        assert_eq!(normalize_field_name(" free sulfur\tdioxide "), "free_sulfur_dioxide");
        assert_eq!(normalize_field_name("pH"), "pH");
    }

    #[test]
    fn colliding_column_names_are_rejected() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::Reject);
        let rows = vec![raw(json!({
            "fixed acidity": 7.4, "fixed_acidity": 7.9, "alcohol": 9.4, "quality": 5
        }))];
        let msg = match normalizer.normalize(&rows, "red").unwrap_err() {
            PipelineError::Schema(msg) => msg,
            other => panic!("expected a schema error, got {other:?}"),
        };
        assert!(msg.contains("'fixed acidity'") && msg.contains("'fixed_acidity'"));
    }

    #[test]
    fn renames_coerces_and_labels_every_row() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::Reject);
        let rows = vec![
            raw(json!({"fixed acidity": "7.4", "alcohol": "9.4", "quality": "5"})),
            raw(json!({"fixed acidity": 6.0, "alcohol": 10.5, "quality": 8.0, "extra col": "x"})),
        ];
        let out = normalizer.normalize(&rows, "red").unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.source_label == "red"));
        assert!(out
            .iter()
            .flat_map(|r| r.attributes.keys())
            .all(|k| !k.chars().any(char::is_whitespace)));
        assert_eq!(out[0].attributes["fixed_acidity"], 7.4);
        assert_eq!(out[0].quality, 5);
        assert_eq!(out[1].quality, 8);
        assert_eq!(out[1].raw_key, "winequality-red.csv");
        assert!(!out[1].attributes.contains_key("extra_col"));
    }

    #[test]
    fn missing_quality_is_schema_error() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::FillMean);
        let rows = vec![raw(json!({"fixed acidity": 7.4, "alcohol": 9.4}))];
        let err = normalizer.normalize(&rows, "red").unwrap_err();
        assert!(matches!(err, PipelineError::Schema(m) if m.contains("quality")));
    }

    #[test]
    fn fractional_quality_is_schema_error() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::Reject);
        let rows = vec![raw(json!({"fixed acidity": 7.4, "alcohol": 9.4, "quality": 5.5}))];
        assert!(matches!(
            normalizer.normalize(&rows, "red"),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn reject_policy_fails_whole_batch_on_one_bad_value() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::Reject);
        let rows = vec![
            raw(json!({"fixed acidity": 7.4, "alcohol": 9.4, "quality": 5})),
            raw(json!({"fixed acidity": "n/a", "alcohol": 9.8, "quality": 6})),
        ];
        let err = normalizer.normalize(&rows, "red").unwrap_err();
        assert!(matches!(err, PipelineError::Schema(m) if m.contains("row 1") && m.contains("fixed_acidity")));
    }

    #[test]
    fn fill_mean_policy_uses_batch_mean() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::FillMean);
        let rows = vec![
            raw(json!({"fixed acidity": 7.0, "alcohol": 9.0, "quality": 5})),
            raw(json!({"alcohol": 11.0, "quality": 6})),
            raw(json!({"fixed acidity": 9.0, "alcohol": "", "quality": 7})),
        ];
        let out = normalizer.normalize(&rows, "white").unwrap();
        assert_eq!(out[1].attributes["fixed_acidity"], 8.0);
        assert_eq!(out[2].attributes["alcohol"], 10.0);
    }

    #[test]
    fn fill_mean_without_any_value_still_fails() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::FillMean);
        let rows = vec![raw(json!({"alcohol": 9.0, "quality": 5}))];
        assert!(normalizer.normalize(&rows, "white").is_err());
    }

    #[test]
    fn empty_label_is_rejected() {
        let normalizer = Normalizer::new(schema(), MissingValuePolicy::Reject);
        let rows = vec![raw(json!({"fixed acidity": 7.4, "alcohol": 9.4, "quality": 5}))];
        assert!(matches!(
            normalizer.normalize(&rows, "  "),
            Err(PipelineError::Schema(_))
        ));
    }
}
