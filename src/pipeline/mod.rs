// Layered raw -> staged -> curated pipeline

pub mod curated;
pub mod enrich;
pub mod fingerprint;
pub mod normalize;
pub mod orchestrator;
pub mod raw;
pub mod staging;
pub mod watermark;

pub use orchestrator::{InlineReport, Orchestrator, RetryPolicy, RunReport, RunState, Stage};
