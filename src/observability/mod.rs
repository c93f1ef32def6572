// Observability: metrics recording and exposition

pub mod metrics;

pub use metrics::{init_metrics, render};
