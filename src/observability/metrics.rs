//! Pipeline metrics, grouped by phase.
//!
//! Recording functions are cheap no-ops until [`init_metrics`] installs the
//! Prometheus recorder.

use std::net::SocketAddr;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Idempotent.
///
/// With `listen_addr` set and a tokio runtime running, the HTTP exporter is
/// spawned on that runtime. The in-process handle is always kept for
/// `/metrics` rendering.
pub fn init_metrics(listen_addr: Option<&str>) {
    INIT.call_once(|| {
        let addr = listen_addr.and_then(|addr_str| match addr_str.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Invalid metrics addr '{}': {}", addr_str, e);
                None
            }
        });

        match (addr, tokio::runtime::Handle::try_current()) {
            (Some(addr), Ok(runtime)) => install_with_listener(addr, &runtime),
            (Some(addr), Err(_)) => {
                warn!("No tokio runtime, metrics listener on {} not started", addr);
                install_recorder_only();
            }
            (None, _) => install_recorder_only(),
        }
    });
}

fn install_with_listener(addr: SocketAddr, runtime: &tokio::runtime::Handle) {
    let _entered = runtime.enter();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    let (recorder, exporter) = match builder.build() {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Failed to build Prometheus exporter on {}: {}", addr, e);
            return install_recorder_only();
        }
    };
    let handle = recorder.handle();
    if let Err(e) = ::metrics::set_global_recorder(recorder) {
        warn!("Failed to install Prometheus recorder: {}", e);
        return;
    }
    keep_handle(handle);
    runtime.spawn(async move {
        if let Err(e) = exporter.await {
            warn!("Prometheus exporter stopped: {:?}", e);
        }
    });
    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
}

fn install_recorder_only() {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            keep_handle(handle);
            info!("Prometheus recorder installed");
        }
        Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
    }
}

fn keep_handle(handle: metrics_exporter_prometheus::PrometheusHandle) {
    if HANDLE.set(handle).is_err() {
        warn!("Metrics handle already set");
    }
}

/// Render the current metrics in Prometheus text format, if installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

pub mod normalize {
    /// Record a normalized batch
    pub fn batch_normalized(source_label: &str, rows: usize) {
        ::metrics::counter!("lakehouse_normalize_rows_total", "label" => source_label.to_string())
            .increment(rows as u64);
        ::metrics::histogram!("lakehouse_normalize_batch_size").record(rows as f64);
    }

    pub fn values_filled(count: usize) {
        ::metrics::counter!("lakehouse_normalize_values_filled_total").increment(count as u64);
    }

    pub fn schema_error() {
        ::metrics::counter!("lakehouse_normalize_schema_errors_total").increment(1);
    }
}

pub mod staging {
    pub fn rows_appended(count: usize) {
        ::metrics::counter!("lakehouse_staging_rows_total").increment(count as u64);
    }

    pub fn rows_rejected(count: usize) {
        ::metrics::counter!("lakehouse_staging_rows_rejected_total").increment(count as u64);
    }

    pub fn duplicate_batch() {
        ::metrics::counter!("lakehouse_staging_duplicate_batches_total").increment(1);
    }
}

pub mod enrich {
    use crate::domain::QualityCategory;

    pub fn categorized(category: QualityCategory) {
        ::metrics::counter!("lakehouse_enrich_records_total", "category" => category.as_str())
            .increment(1);
    }

    pub fn domain_error() {
        ::metrics::counter!("lakehouse_enrich_domain_errors_total").increment(1);
    }
}

pub mod curated {
    pub fn documents_inserted(count: usize) {
        ::metrics::counter!("lakehouse_curated_documents_total").increment(count as u64);
    }
}

pub mod pipeline {
    pub fn stage_completed(stage: &'static str, secs: f64) {
        ::metrics::counter!("lakehouse_stage_runs_total", "stage" => stage, "outcome" => "ok")
            .increment(1);
        ::metrics::histogram!("lakehouse_stage_duration_seconds", "stage" => stage).record(secs);
    }

    pub fn stage_failed(stage: &'static str) {
        ::metrics::counter!("lakehouse_stage_runs_total", "stage" => stage, "outcome" => "error")
            .increment(1);
    }

    pub fn stage_skipped(stage: &'static str) {
        ::metrics::counter!("lakehouse_stage_skipped_total", "stage" => stage).increment(1);
    }

    pub fn run_retried() {
        ::metrics::counter!("lakehouse_run_retries_total").increment(1);
    }
}

pub mod api {
    pub fn request(route: &'static str, status: u16) {
        ::metrics::counter!("lakehouse_api_requests_total", "route" => route, "status" => status.to_string())
            .increment(1);
    }

    pub fn ingest_duration(secs: f64) {
        ::metrics::histogram!("lakehouse_api_ingest_duration_seconds").record(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_serves_rendered_metrics() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        init_metrics(Some(&addr.to_string()));
        curated::documents_inserted(3);

        let mut connected = false;
        for _ in 0..20 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(connected, "metrics listener not reachable on {addr}");
        assert!(render().unwrap().contains("lakehouse_curated_documents_total"));
    }
}
