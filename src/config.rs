use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants;
use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "lakehouse.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub schema: SchemaConfig,
    pub pipeline: PipelineConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
    /// Files copied to the raw layer as-is (dataset descriptions). Skipped
    /// with a warning when absent from the landing directory.
    #[serde(default = "default_raw_only")]
    pub raw_only: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for raw blobs, the staging database and curated collections.
    pub data_root: PathBuf,
    /// Where scheduled runs pick up source files.
    pub landing_dir: PathBuf,
    pub staging_table: String,
    pub curated_collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            landing_dir: PathBuf::from("data/landing"),
            staging_table: constants::STAGING_TABLE.to_string(),
            curated_collection: constants::CURATED_COLLECTION.to_string(),
        }
    }
}

impl StorageConfig {
    pub fn raw_dir(&self) -> PathBuf {
        self.data_root.join("raw")
    }

    pub fn staging_db(&self) -> PathBuf {
        self.data_root.join("staging").join("staging.db")
    }

    pub fn curated_dir(&self) -> PathBuf {
        self.data_root.join("curated")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub attributes: Vec<String>,
    pub score_field: String,
    pub label_field: String,
    pub score_min: i64,
    pub score_max: i64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            attributes: constants::DEFAULT_ATTRIBUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            score_field: constants::SCORE_FIELD.to_string(),
            label_field: constants::LABEL_FIELD.to_string(),
            score_min: 0,
            score_max: 10,
        }
    }
}

/// How missing or non-numeric attribute values are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuePolicy {
    /// Fail the batch with a schema error.
    #[default]
    Reject,
    /// Substitute the column mean over the valid rows of the batch.
    FillMean,
}

/// How the staging writer reacts to a row the store refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// One bulk append; the first failure aborts the whole call.
    #[default]
    FailFast,
    /// Row-by-row appends; failures are collected and reported.
    BestEffort,
}

/// Which staged rows the load stage reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurateMode {
    /// Re-read the whole staging table on every run.
    Full,
    /// Only rows past the persisted watermark.
    #[default]
    Incremental,
}

impl std::str::FromStr for CurateMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(CurateMode::Full),
            "incremental" => Ok(CurateMode::Incremental),
            other => Err(PipelineError::Config(format!("unknown curate mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub missing_values: MissingValuePolicy,
    pub write_policy: WritePolicy,
    pub curate_mode: CurateMode,
    pub dedupe_batches: bool,
    pub resume_from_checkpoint: bool,
    pub csv_delimiter: char,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            missing_values: MissingValuePolicy::Reject,
            write_policy: WritePolicy::FailFast,
            curate_mode: CurateMode::Incremental,
            dedupe_batches: true,
            resume_from_checkpoint: false,
            csv_delimiter: ';',
            retries: 1,
            retry_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub default_limit: usize,
    pub max_limit: usize,
    pub stats_field: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            default_limit: constants::DEFAULT_LIMIT,
            max_limit: constants::MAX_LIMIT,
            stats_field: constants::STATS_FIELD.to_string(),
        }
    }
}

impl ApiConfig {
    /// Default a missing limit and clamp it to `max_limit`.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "lakehouse.log".to_string(),
            filter: "lakehouse=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener, e.g. "127.0.0.1:9898". Disabled when unset.
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    pub label: String,
}

fn default_raw_only() -> Vec<String> {
    vec![constants::DATASET_NAMES_FILE.to_string()]
}

fn default_sources() -> Vec<SourceConfig> {
    constants::default_sources()
        .into_iter()
        .map(|(file, label)| SourceConfig {
            file: file.to_string(),
            label: label.to_string(),
        })
        .collect()
}

impl Config {
    /// Load from `path` (or `LAKEHOUSE_CONFIG`, or `lakehouse.toml`), then
    /// apply environment overrides. A missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LAKEHOUSE_CONFIG").ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default_with_sources()
            }
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Defaults including the two wine sources. `Default` alone leaves
    /// `sources` empty.
    pub fn default_with_sources() -> Self {
        Self {
            sources: default_sources(),
            raw_only: default_raw_only(),
            ..Default::default()
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("LAKEHOUSE_DATA_ROOT") {
            self.storage.landing_dir = PathBuf::from(&root).join("landing");
            self.storage.data_root = PathBuf::from(root);
        }
        if let Ok(port) = std::env::var("LAKEHOUSE_PORT") {
            self.api.port = port
                .parse()
                .map_err(|e| PipelineError::Config(format!("LAKEHOUSE_PORT '{port}': {e}")))?;
        }
        if let Ok(mode) = std::env::var("LAKEHOUSE_CURATE_MODE") {
            self.pipeline.curate_mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.score_min > self.schema.score_max {
            return Err(PipelineError::Config(format!(
                "score_min {} exceeds score_max {}",
                self.schema.score_min, self.schema.score_max
            )));
        }
        if self.api.default_limit > self.api.max_limit {
            return Err(PipelineError::Config(
                "api.default_limit exceeds api.max_limit".to_string(),
            ));
        }
        if !self.pipeline.csv_delimiter.is_ascii() {
            return Err(PipelineError::Config(
                "pipeline.csv_delimiter must be an ASCII character".to_string(),
            ));
        }
        if self.sources.iter().any(|s| s.label.trim().is_empty()) {
            return Err(PipelineError::Config("every source needs a label".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults_with_wine_sources() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.pipeline.csv_delimiter, ';');
        assert_eq!(config.pipeline.curate_mode, CurateMode::Incremental);
        assert_eq!(config.storage.staging_table, "wine_data");
        assert_eq!(config.schema.attributes.len(), 11);
    }

    #[test]
    fn parses_policies_and_sources() {
        let config = Config::from_toml(
            r#"
            [pipeline]
            missing_values = "fill_mean"
            write_policy = "best_effort"
            curate_mode = "full"

            [[sources]]
            file = "rose.csv"
            label = "rose"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.missing_values, MissingValuePolicy::FillMean);
        assert_eq!(config.pipeline.write_policy, WritePolicy::BestEffort);
        assert_eq!(config.pipeline.curate_mode, CurateMode::Full);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].label, "rose");
    }

    #[test]
    fn effective_limit_defaults_and_clamps() {
        let api = ApiConfig::default();
        assert_eq!(api.effective_limit(None), 10);
        assert_eq!(api.effective_limit(Some(5)), 5);
        assert_eq!(api.effective_limit(Some(1_000_000)), 1000);
    }

    #[test]
    fn rejects_inverted_score_bounds() {
        let config = Config::from_toml("[schema]\nscore_min = 5\nscore_max = 1\n").unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }
}
