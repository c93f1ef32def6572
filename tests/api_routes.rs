use axum::http::{Request, StatusCode};
use axum::Router;
use hyper::Body;
use serde_json::{json, Value};
use tower::ServiceExt;

use lakehouse::bootstrap::Stores;
use lakehouse::config::Config;
use lakehouse::server::{create_router, AppState};

fn app() -> Router {
    let config = Config::default_with_sources();
    create_router(AppState::new(&Stores::in_memory(), &config))
}

fn wine(label: &str, quality: i64, alcohol: f64) -> Value {
    json!({
        "wine_type": label, "fixed acidity": 7.4, "volatile acidity": 0.7,
        "citric acid": 0.0, "residual sugar": 1.9, "chlorides": 0.076,
        "free sulfur dioxide": 11.0, "total sulfur dioxide": 34.0,
        "density": 0.9978, "pH": 3.51, "sulphates": 0.56,
        "alcohol": alcohol, "quality": quality
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_answers() {
    let (status, body) = send(&app(), get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn ingest_then_filter_and_aggregate() {
    let app = app();
    let (status, body) = send(&app, post("/ingest", &wine("red", 5, 9.4))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingested"], 1);
    assert!(body["processing_time_seconds"].is_number());

    let (status, body) = send(&app, post("/ingest_fast", &json!([wine("white", 8, 8.8)]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingested"], 1);

    let (status, body) = send(&app, get("/wines?quality_category=good&limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["count"].as_u64().unwrap() <= 5);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert!(data.iter().all(|d| d["quality_category"] == "good"));

    let (_, body) = send(&app, get("/wines?wine_type=red")).await;
    assert_eq!(body["data"][0]["quality_category"], "average");

    let (status, body) = send(&app, get("/wines/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let stats = body["stats"].as_array().unwrap();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s["count"] == 1));

    let (_, body) = send(&app, get("/staging?limit=1")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["channel"], "inline");

    let (_, body) = send(&app, get("/curated")).await;
    assert_eq!(body["count"], 2);
}

#[tokio::test]
async fn missing_raw_file_is_404_with_detail() {
    let (status, body) = send(&app(), get("/raw/winequality-red.csv")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("winequality-red.csv"));
}

#[tokio::test]
async fn invalid_payload_is_500_and_stores_nothing_downstream() {
    let app = app();
    let mut payload = wine("red", 5, 9.4);
    payload.as_object_mut().unwrap().remove("quality");
    let (status, body) = send(&app, post("/ingest", &payload)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("quality"));

    let (_, body) = send(&app, get("/curated")).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn empty_query_parameters_fall_back_to_defaults() {
    let app = app();
    send(&app, post("/ingest", &wine("red", 5, 9.4))).await;

    let (status, body) = send(&app, get("/wines?wine_type=&quality_category=&limit=")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, body) = send(&app, get("/staging?limit=")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn malformed_requests_answer_with_a_detail_body() {
    let app = app();
    let (status, body) = send(&app, get("/wines?limit=abc")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("invalid request"));

    let req = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn concurrent_identical_posts_both_land() {
    let app = app();
    let payload = wine("white", 7, 11.0);
    let (a, b) = tokio::join!(
        send(&app, post("/ingest", &payload)),
        send(&app, post("/ingest", &payload))
    );
    assert_eq!(a.0, StatusCode::OK);
    assert_eq!(b.0, StatusCode::OK);

    let (_, staged) = send(&app, get("/staging")).await;
    assert_eq!(staged["count"], 2);
    let (_, curated) = send(&app, get("/curated")).await;
    assert_eq!(curated["count"], 2);
}
