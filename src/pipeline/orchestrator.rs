use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::app::ports::{Checkpoint, CheckpointStore, RawStore};
use crate::bootstrap::Stores;
use crate::config::{Config, CurateMode, SourceConfig};
use crate::constants;
use crate::domain::{Channel, RawRecord, StagedRecord};
use crate::error::{PipelineError, Result, RunError};
use crate::observability::metrics;
use crate::pipeline::curated::CuratedWriter;
use crate::pipeline::enrich::Enricher;
use crate::pipeline::fingerprint::batch_fingerprint;
use crate::pipeline::normalize::Normalizer;
use crate::pipeline::raw;
use crate::pipeline::staging::StagingWriter;
use crate::pipeline::watermark::Watermark;

/// The three ordered stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Source files -> raw store.
    Ingest,
    /// Raw store -> staging (normalize + append).
    Transform,
    /// Staging -> curated (enrich + append).
    Load,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Ingest, Stage::Transform, Stage::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }

    /// State reached once this stage succeeds.
    pub fn reaches(&self) -> RunState {
        match self {
            Stage::Ingest => RunState::Ingested,
            Stage::Transform => RunState::Staged,
            Stage::Load => RunState::Curated,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ingest" => Ok(Stage::Ingest),
            "transform" => Ok(Stage::Transform),
            "load" => Ok(Stage::Load),
            other => Err(PipelineError::Schema(format!("unknown stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Ingested,
    Staged,
    Curated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    /// Blobs stored, rows staged or documents curated, depending on the stage.
    pub records: usize,
    /// Completed in an earlier attempt of the same run and not re-executed.
    pub skipped: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub attempts: u32,
    pub stages: Vec<StageOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    /// One retry after five minutes, like the daily schedule.
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(300),
        }
    }
}

/// Result of synchronously ingesting one payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineReport {
    pub raw_key: String,
    pub staged: usize,
    pub curated: usize,
}

struct Settings {
    landing_dir: PathBuf,
    sources: Vec<SourceConfig>,
    raw_only: Vec<String>,
    curate_mode: CurateMode,
    dedupe_batches: bool,
    resume_from_checkpoint: bool,
    csv_delimiter: u8,
    label_field: String,
}

/// Sequences normalize -> stage -> enrich -> curate over injected stores.
pub struct Orchestrator {
    raw: Arc<dyn RawStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    normalizer: Normalizer,
    staging: StagingWriter,
    enricher: Enricher,
    curated: CuratedWriter,
    watermark: Watermark,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(stores: &Stores, config: &Config) -> Self {
        Self {
            raw: stores.raw.clone(),
            checkpoints: stores.checkpoints.clone(),
            normalizer: Normalizer::new(config.schema.clone(), config.pipeline.missing_values),
            staging: StagingWriter::new(
                stores.staging.clone(),
                config.storage.staging_table.clone(),
                config.pipeline.write_policy,
            ),
            enricher: Enricher::from_schema(&config.schema),
            curated: CuratedWriter::new(
                stores.documents.clone(),
                config.storage.curated_collection.clone(),
            ),
            watermark: Watermark::new(stores.checkpoints.clone(), constants::CURATE_CURSOR),
            settings: Settings {
                landing_dir: config.storage.landing_dir.clone(),
                sources: config.sources.clone(),
                raw_only: config.raw_only.clone(),
                curate_mode: config.pipeline.curate_mode,
                dedupe_batches: config.pipeline.dedupe_batches,
                resume_from_checkpoint: config.pipeline.resume_from_checkpoint,
                // validated ASCII in Config::validate
                csv_delimiter: config.pipeline.csv_delimiter as u8,
                label_field: config.schema.label_field.clone(),
            },
        }
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn staging(&self) -> &StagingWriter {
        &self.staging
    }

    pub fn curated(&self) -> &CuratedWriter {
        &self.curated
    }

    pub fn raw_store(&self) -> &Arc<dyn RawStore> {
        &self.raw
    }

    pub fn csv_delimiter(&self) -> u8 {
        self.settings.csv_delimiter
    }

    /// Run all three stages, resuming per configuration.
    pub async fn run(&self, run_id: &str) -> std::result::Result<RunReport, RunError> {
        self.run_with_options(run_id, self.settings.resume_from_checkpoint)
            .await
    }

    /// Run all three stages. With `resume`, stages already checkpointed for
    /// `run_id` are skipped; otherwise the run starts from `ingest`.
    #[instrument(skip(self))]
    pub async fn run_with_options(
        &self,
        run_id: &str,
        resume: bool,
    ) -> std::result::Result<RunReport, RunError> {
        let done = if resume {
            self.checkpoints
                .last_checkpoint(run_id)
                .await
                .map_err(|e| RunError::new(Stage::Ingest, e))?
                .map(|cp| cp.stage)
        } else {
            None
        };

        info!("🚀 Starting run '{}'", run_id);
        let mut report = RunReport {
            run_id: run_id.to_string(),
            state: done.map_or(RunState::Pending, |s| s.reaches()),
            attempts: 1,
            stages: Vec::with_capacity(Stage::ALL.len()),
        };

        for stage in Stage::ALL {
            if done.is_some_and(|d| stage <= d) {
                info!("⏭️ Stage '{}' already completed for run '{}'", stage, run_id);
                metrics::pipeline::stage_skipped(stage.as_str());
                report.stages.push(StageOutcome {
                    stage,
                    records: 0,
                    skipped: true,
                    detail: "completed in an earlier attempt".to_string(),
                });
                continue;
            }

            let outcome = self.run_stage(stage).await?;
            let checkpoint = Checkpoint {
                stage,
                cursor: match stage {
                    Stage::Load => Some(
                        self.watermark
                            .current()
                            .await
                            .map_err(|e| RunError::new(stage, e))?,
                    ),
                    _ => None,
                },
                completed_at: Utc::now(),
            };
            self.checkpoints
                .record_checkpoint(run_id, &checkpoint)
                .await
                .map_err(|e| RunError::new(stage, e))?;
            report.state = stage.reaches();
            report.stages.push(outcome);
        }

        info!("🎉 Run '{}' reached {:?}", run_id, report.state);
        Ok(report)
    }

    /// Whole-run restarts on failure, `policy.retries` times.
    pub async fn run_with_retries(
        &self,
        run_id: &str,
        policy: RetryPolicy,
    ) -> std::result::Result<RunReport, RunError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run(run_id).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Err(e) if attempt <= policy.retries => {
                    warn!(
                        "Run '{}' attempt {} failed ({}), retrying in {:?}",
                        run_id, attempt, e, policy.delay
                    );
                    metrics::pipeline::run_retried();
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute a single stage, timing it and tagging failures with the stage.
    pub async fn run_stage(&self, stage: Stage) -> std::result::Result<StageOutcome, RunError> {
        info!("🔄 Executing stage '{}'", stage);
        let started = Instant::now();
        let result = match stage {
            Stage::Ingest => self
                .ingest_sources()
                .await
                .map(|n| (n, format!("{n} files stored in raw layer"))),
            Stage::Transform => self.transform().await,
            Stage::Load => self.load().await,
        };

        match result {
            Ok((records, detail)) => {
                metrics::pipeline::stage_completed(stage.as_str(), started.elapsed().as_secs_f64());
                info!("✅ Stage '{}' completed: {}", stage, detail);
                Ok(StageOutcome {
                    stage,
                    records,
                    skipped: false,
                    detail,
                })
            }
            Err(e) => {
                metrics::pipeline::stage_failed(stage.as_str());
                error!("❌ Stage '{}' failed: {}", stage, e);
                Err(RunError::new(stage, e))
            }
        }
    }

    /// Copy every configured source file into the raw store under its name.
    async fn ingest_sources(&self) -> Result<usize> {
        for source in &self.settings.sources {
            let path = self.settings.landing_dir.join(&source.file);
            let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    PipelineError::NotFound(format!("source file {}", path.display()))
                }
                _ => PipelineError::Io(e),
            })?;
            self.raw.put(&source.file, &bytes).await?;
            info!("📥 Stored {} ({} bytes) in raw layer", source.file, bytes.len());
        }

        let mut stored = self.settings.sources.len();
        for file in &self.settings.raw_only {
            let path = self.settings.landing_dir.join(file);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    self.raw.put(file, &bytes).await?;
                    info!("📥 Stored {} ({} bytes) in raw layer", file, bytes.len());
                    stored += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Raw-only file {} not found, skipped", path.display());
                }
                Err(e) => return Err(PipelineError::Io(e)),
            }
        }
        Ok(stored)
    }

    /// Normalize every source before writing any of them, then append each
    /// source as one keyed batch.
    async fn transform(&self) -> Result<(usize, String)> {
        let mut batches: Vec<(&SourceConfig, Vec<StagedRecord>)> = Vec::new();
        for source in &self.settings.sources {
            let bytes = self.raw.get(&source.file).await?;
            let rows = raw::decode(&source.file, &bytes, self.settings.csv_delimiter, Utc::now())?;
            let staged = self.normalizer.normalize(&rows, &source.label)?;
            self.enricher.validate_all(&staged)?;
            batches.push((source, staged));
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        let mut rejected = 0;
        for (source, staged) in &batches {
            let key = if self.settings.dedupe_batches {
                Some(batch_fingerprint(self.staging.table(), staged)?)
            } else {
                None
            };
            let report = self
                .staging
                .append_staged(staged, Channel::Batch, key.as_deref())
                .await?;
            if report.duplicate_batch {
                duplicates += 1;
                info!("♻️ {} already staged, skipped", source.file);
            }
            inserted += report.inserted;
            rejected += report.rejected.len();
        }

        Ok((
            inserted,
            format!(
                "{inserted} rows staged from {} sources ({duplicates} replayed, {rejected} rows rejected)",
                batches.len()
            ),
        ))
    }

    /// Enrich staged rows into the curated store.
    async fn load(&self) -> Result<(usize, String)> {
        let rows = match self.settings.curate_mode {
            CurateMode::Full => self.staging.read_all().await?,
            CurateMode::Incremental => {
                let after = self.watermark.init().await?;
                self.staging.read_after(after, Some(Channel::Batch)).await?
            }
        };

        let staged: Vec<StagedRecord> = rows.iter().map(|r| r.record.clone()).collect();
        let curated = self.enricher.enrich(&staged)?;
        let inserted = self.curated.append_curated(&curated).await?;

        if self.settings.curate_mode == CurateMode::Incremental {
            if let Some(last) = rows.last() {
                self.watermark.advance(last.offset).await?;
            }
        }

        Ok((
            inserted,
            format!(
                "{inserted} documents curated from {} staged rows ({:?} mode)",
                rows.len(),
                self.settings.curate_mode
            ),
        ))
    }

    /// Drive raw -> staged -> curated for one API payload.
    ///
    /// The payload always lands in the raw layer. A schema or domain failure
    /// stops before staging, so nothing partial reaches the later layers.
    #[instrument(skip(self, payload))]
    pub async fn ingest_inline(&self, payload: &Value) -> Result<InlineReport> {
        let raw_key = format!(
            "{}/{}-{}.json",
            constants::INLINE_RAW_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::new_v4()
        );
        self.raw.put(&raw_key, &serde_json::to_vec(payload)?).await?;

        let Value::Object(fields) = payload else {
            return Err(PipelineError::Schema("payload must be a JSON object".to_string()));
        };
        let label = match fields.get(&self.settings.label_field) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(PipelineError::Schema(format!(
                    "field '{}' must be a string, got {other}",
                    self.settings.label_field
                )))
            }
            None => {
                return Err(PipelineError::Schema(format!(
                    "missing field '{}'",
                    self.settings.label_field
                )))
            }
        };

        let record = RawRecord::new(
            raw_key.clone(),
            Utc::now(),
            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        let staged = self.normalizer.normalize(std::slice::from_ref(&record), &label)?;
        let curated = self.enricher.enrich(&staged)?;

        let report = self
            .staging
            .append_staged(&staged, Channel::Inline, None)
            .await?;
        if let Some(rejection) = report.rejected.first() {
            return Err(PipelineError::Write(rejection.message.clone()));
        }
        let inserted = self.curated.append_curated(&curated).await?;

        Ok(InlineReport {
            raw_key,
            staged: report.inserted,
            curated: inserted,
        })
    }
}
