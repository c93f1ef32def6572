//! Record shapes for the three storage layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Untyped field bag as received from a source file or API call.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// A row as it arrived, identified by the raw key it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub origin: String,
    pub ingested_at: DateTime<Utc>,
    pub fields: FieldMap,
}

impl RawRecord {
    pub fn new(origin: impl Into<String>, ingested_at: DateTime<Utc>, fields: FieldMap) -> Self {
        Self {
            origin: origin.into(),
            ingested_at,
            fields,
        }
    }
}

/// A record in the canonical staging schema.
///
/// Serializes flat: each attribute is a top-level key next to `quality`,
/// `wine_type` (the source label) and `raw_key`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedRecord {
    #[serde(flatten)]
    pub attributes: BTreeMap<String, f64>,
    pub quality: i64,
    #[serde(rename = "wine_type")]
    pub source_label: String,
    pub raw_key: String,
}

/// Which ingestion path produced a staged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Scheduled file runs; picked up by the load stage.
    Batch,
    /// API ingestion; curated inline by the request that staged it.
    Inline,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Batch => "batch",
            Channel::Inline => "inline",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(Channel::Batch),
            "inline" => Ok(Channel::Inline),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// A staged record read back from the store, with its store-assigned offset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub offset: u64,
    pub channel: Channel,
    #[serde(flatten)]
    pub record: StagedRecord,
}

/// Three-valued classification of the quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityCategory {
    Poor,
    Average,
    Good,
}

impl QualityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCategory::Poor => "poor",
            QualityCategory::Average => "average",
            QualityCategory::Good => "good",
        }
    }
}

impl fmt::Display for QualityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poor" => Ok(QualityCategory::Poor),
            "average" => Ok(QualityCategory::Average),
            "good" => Ok(QualityCategory::Good),
            other => Err(format!("unknown quality category '{other}'")),
        }
    }
}

/// A staged record plus its derived quality category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuratedRecord {
    #[serde(flatten)]
    pub staged: StagedRecord,
    pub quality_category: QualityCategory,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged() -> StagedRecord {
        StagedRecord {
            attributes: BTreeMap::from([("alcohol".to_string(), 9.4)]),
            quality: 5,
            source_label: "red".to_string(),
            raw_key: "winequality-red.csv".to_string(),
        }
    }

    #[test]
    fn curated_record_serializes_flat() {
        let curated = CuratedRecord {
            staged: staged(),
            quality_category: QualityCategory::Average,
        };
        let value = serde_json::to_value(&curated).unwrap();
        assert_eq!(value["alcohol"], 9.4);
        assert_eq!(value["quality"], 5);
        assert_eq!(value["wine_type"], "red");
        assert_eq!(value["quality_category"], "average");
        assert!(value.get("attributes").is_none());
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("GOOD".parse::<QualityCategory>(), Ok(QualityCategory::Good));
        assert!("bonne".parse::<QualityCategory>().is_err());
    }
}
