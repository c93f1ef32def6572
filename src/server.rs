use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hyper::Server;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::bootstrap::Stores;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::Orchestrator;
use crate::query::{LimitQuery, QueryService, WineQuery};

#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryService>,
}

impl AppState {
    pub fn new(stores: &Stores, config: &Config) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(stores, config));
        Self {
            query: Arc::new(QueryService::new(
                orchestrator,
                config.api.clone(),
                config.schema.label_field.clone(),
            )),
        }
    }
}

/// Error body `{ "detail": ... }`; not-found maps to 404, everything else 500.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match e {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn respond<T: Serialize>(route: &'static str, result: Result<T>) -> Response {
    match result {
        Ok(body) => {
            metrics::api::request(route, StatusCode::OK.as_u16());
            Json(body).into_response()
        }
        Err(e) => {
            let err = ApiError::from(e);
            if err.status.is_server_error() {
                error!("{} failed: {}", route, err.detail);
            }
            metrics::api::request(route, err.status.as_u16());
            err.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "message": "Wine quality API (curated layer)",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Extractor failures answer like any other error: a `{detail}` body.
fn rejected(route: &'static str, detail: String) -> Response {
    respond::<()>(route, Err(PipelineError::Schema(format!("invalid request: {detail}"))))
}

async fn list_wines(
    State(state): State<AppState>,
    query: std::result::Result<Query<WineQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(q)) => respond("/wines", state.query.list(&q).await),
        Err(r) => rejected("/wines", r.body_text()),
    }
}

async fn wine_stats(State(state): State<AppState>) -> Response {
    respond("/wines/stats", state.query.stats().await)
}

async fn raw_file(
    State(state): State<AppState>,
    filename: std::result::Result<Path<String>, PathRejection>,
) -> Response {
    match filename {
        Ok(Path(filename)) => respond("/raw", state.query.raw(&filename).await),
        Err(r) => rejected("/raw", r.body_text()),
    }
}

async fn staging_rows(
    State(state): State<AppState>,
    query: std::result::Result<Query<LimitQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(q)) => respond("/staging", state.query.staging(q.limit).await),
        Err(r) => rejected("/staging", r.body_text()),
    }
}

async fn curated_docs(
    State(state): State<AppState>,
    query: std::result::Result<Query<LimitQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(q)) => respond("/curated", state.query.curated(q.limit).await),
        Err(r) => rejected("/curated", r.body_text()),
    }
}

async fn ingest_one(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => respond("/ingest", state.query.ingest(&payload).await),
        Err(r) => rejected("/ingest", r.body_text()),
    }
}

async fn ingest_many(
    State(state): State<AppState>,
    payloads: std::result::Result<Json<Vec<Value>>, JsonRejection>,
) -> Response {
    match payloads {
        Ok(Json(payloads)) => respond("/ingest_fast", state.query.ingest_batch(&payloads).await),
        Err(r) => rejected("/ingest_fast", r.body_text()),
    }
}

async fn metrics_text() -> Response {
    match metrics::render() {
        Some(body) => body.into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "detail": "metrics not enabled" })))
            .into_response(),
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/wines", get(list_wines))
        .route("/wines/stats", get(wine_stats))
        .route("/raw/:filename", get(raw_file))
        .route("/staging", get(staging_rows))
        .route("/curated", get(curated_docs))
        .route("/ingest", post(ingest_one))
        .route("/ingest_fast", post(ingest_many))
        .route("/metrics", get(metrics_text))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(cors))
}

/// Open the configured stores and serve the API until the process exits.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    metrics::init_metrics(config.metrics.listen_addr.as_deref());
    let stores = Stores::open(config)?;
    let app = create_router(AppState::new(&stores, config));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    info!("🚀 HTTP server running on http://localhost:{}", config.api.port);
    info!("🍷 Wines:   http://localhost:{}/wines", config.api.port);
    info!("📊 Stats:   http://localhost:{}/wines/stats", config.api.port);

    Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
