use thiserror::Error;

use crate::pipeline::orchestrator::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("write rejected: {0}")]
    Write(String),

    #[error("domain error: {0}")]
    Domain(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                PipelineError::Write(err.to_string())
            }
            _ => PipelineError::Store(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A pipeline run halted at `stage`. Earlier stages' writes are kept.
#[derive(Error, Debug)]
#[error("stage '{stage}' failed: {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl RunError {
    pub fn new(stage: Stage, source: PipelineError) -> Self {
        Self { stage, source }
    }
}
