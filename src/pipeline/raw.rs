use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{FieldMap, RawRecord};
use crate::error::{PipelineError, Result};

/// Decode a raw blob into records.
///
/// Keys ending in `.json` hold one object or an array of objects; anything
/// else is delimited text with a header row.
pub fn decode(
    key: &str,
    bytes: &[u8],
    delimiter: u8,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>> {
    let rows = if key.ends_with(".json") {
        decode_json(key, bytes)?
    } else {
        decode_delimited(key, bytes, delimiter)?
    };
    Ok(rows
        .into_iter()
        .map(|fields| RawRecord::new(key, ingested_at, fields))
        .collect())
}

fn decode_json(key: &str, bytes: &[u8]) -> Result<Vec<FieldMap>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::Schema(format!("{key}: invalid JSON: {e}")))?;
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => {
            return Err(PipelineError::Schema(format!(
                "{key}: expected a JSON object or array of objects"
            )))
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(PipelineError::Schema(format!("{key}: item {i} is not an object"))),
        })
        .collect()
}

fn decode_delimited(key: &str, bytes: &[u8], delimiter: u8) -> Result<Vec<FieldMap>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::Schema(format!("{key}: unreadable header: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(PipelineError::Schema(format!("{key}: no columns found")));
    }

    let mut rows = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            PipelineError::Schema(format!("{key}: row {}: {e}", row_idx + 1))
        })?;
        let fields = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
            .collect();
        rows.push(fields);
    }
    Ok(rows)
}
