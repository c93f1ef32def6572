use tracing::debug;

use crate::config::SchemaConfig;
use crate::domain::{CuratedRecord, QualityCategory, StagedRecord};
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

/// Category for a quality score: <= 4 poor, 5-6 average, >= 7 good.
pub fn category_of(score: i64) -> QualityCategory {
    match score {
        i64::MIN..=4 => QualityCategory::Poor,
        5..=6 => QualityCategory::Average,
        _ => QualityCategory::Good,
    }
}

/// Derives curated records from staged ones.
pub struct Enricher {
    score_min: i64,
    score_max: i64,
}

impl Enricher {
    pub fn new(score_min: i64, score_max: i64) -> Self {
        Self {
            score_min,
            score_max,
        }
    }

    pub fn from_schema(schema: &SchemaConfig) -> Self {
        Self::new(schema.score_min, schema.score_max)
    }

    /// Scores outside the configured range are a domain error.
    pub fn validate(&self, record: &StagedRecord) -> Result<()> {
        if (self.score_min..=self.score_max).contains(&record.quality) {
            return Ok(());
        }
        metrics::enrich::domain_error();
        Err(PipelineError::Domain(format!(
            "quality score {} from '{}' outside {}..={}",
            record.quality, record.raw_key, self.score_min, self.score_max
        )))
    }

    pub fn validate_all(&self, records: &[StagedRecord]) -> Result<()> {
        records.iter().try_for_each(|r| self.validate(r))
    }

    pub fn enrich_one(&self, record: &StagedRecord) -> Result<CuratedRecord> {
        self.validate(record)?;
        let quality_category = category_of(record.quality);
        metrics::enrich::categorized(quality_category);
        Ok(CuratedRecord {
            staged: record.clone(),
            quality_category,
        })
    }

    /// Enrich every record, failing on the first out-of-range score.
    pub fn enrich(&self, records: &[StagedRecord]) -> Result<Vec<CuratedRecord>> {
        let curated = records
            .iter()
            .map(|r| self.enrich_one(r))
            .collect::<Result<Vec<_>>>()?;
        debug!("Enriched {} records", curated.len());
        Ok(curated)
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new(0, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn staged(quality: i64) -> StagedRecord {
        StagedRecord {
            attributes: BTreeMap::from([
                ("alcohol".to_string(), 9.4),
                ("pH".to_string(), 3.51),
            ]),
            quality,
            source_label: "red".to_string(),
            raw_key: "winequality-red.csv".to_string(),
        }
    }

    #[test]
    fn category_boundaries() {
        for score in 0..=4 {
            assert_eq!(category_of(score), QualityCategory::Poor, "score {score}");
        }
        for score in 5..=6 {
            assert_eq!(category_of(score), QualityCategory::Average, "score {score}");
        }
        for score in 7..=10 {
            assert_eq!(category_of(score), QualityCategory::Good, "score {score}");
        }
    }

    #[test]
    fn category_is_total() {
        assert_eq!(category_of(i64::MIN), QualityCategory::Poor);
        assert_eq!(category_of(i64::MAX), QualityCategory::Good);
    }

    #[test]
    fn enrich_is_deterministic() {
        let enricher = Enricher::default();
        let input: Vec<_> = (0..=10).map(staged).collect();
        let first = serde_json::to_string(&enricher.enrich(&input).unwrap()).unwrap();
        let second = serde_json::to_string(&enricher.enrich(&input).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn out_of_range_score_is_domain_error() {
        let enricher = Enricher::default();
        let err = enricher.enrich(&[staged(5), staged(11)]).unwrap_err();
        assert!(matches!(err, PipelineError::Domain(_)));
        assert!(enricher.validate(&staged(-1)).is_err());
    }
}
