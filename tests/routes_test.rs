//! HTTP boundary tests driving the router in-process.

mod fixtures;
mod helpers;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use fixtures::*;
use helpers::*;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use media_detect::app_state::AppState;
use media_detect::routes;

async fn app(t: &TestEngine) -> Router {
    let handle = PrometheusBuilder::new().build_recorder().handle();
    let state = AppState {
        engine: t.engine.clone(),
        max_upload_bytes: 10 * 1024 * 1024,
    };
    routes::router(state, Arc::new(handle), Some(t.dir.path().join("outputs")))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn multipart_post(uri: &str, form: MultipartBody) -> Request<Body> {
    let (content_type, body) = form.finish();
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

async fn engine() -> TestEngine {
    test_engine(
        MockDetector::returning(street_scene()),
        MockVideoBackend::new(64, 48, 10.0, 20),
    )
    .await
}

#[tokio::test]
async fn test_root_and_classes() {
    let t = engine().await;
    let app = app(&t).await;

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = send(&app, get("/classes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 80);
    assert_eq!(body["classes"][0], "person");
}

#[tokio::test]
async fn test_health_reports_detector_and_storage() {
    let t = engine().await;
    let app = app(&t).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storage_backend"], "local");
    assert_eq!(body["model_name"], "mock-yolo.pt");
    assert_eq!(body["checks"]["detector"]["status"], "ok");
}

#[tokio::test]
async fn test_predict_waits_for_result() {
    let t = engine().await;
    let app = app(&t).await;

    let form = MultipartBody::new()
        .file("file", "street.png", "image/png", &png_bytes(64, 48))
        .text("conf_threshold", "0.5")
        .text("selected_classes", r#"["person", "car"]"#);
    let (status, body) = send(&app, multipart_post("/predict", form)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["total_detections"], 2);
    assert_eq!(body["detections"][0]["class"], "person");
    assert_eq!(body["image_info"]["width"], 64);

    // The annotated image is served from the outputs directory.
    let url = body["output_image_url"].as_str().unwrap().to_string();
    let response = app.clone().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_predict_rejects_non_image() {
    let t = engine().await;
    let app = app(&t).await;

    let form = MultipartBody::new().file("file", "clip.mp4", "video/mp4", &video_bytes());
    let (status, body) = send(&app, multipart_post("/predict", form)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("image"));

    let form = MultipartBody::new().text("conf_threshold", "0.5");
    let (status, _) = send(&app, multipart_post("/predict", form)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let form = MultipartBody::new()
        .file("file", "a.png", "image/png", &png_bytes(8, 8))
        .text("conf_threshold", "1.5");
    let (status, body) = send(&app, multipart_post("/predict", form)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("threshold"));
}

#[tokio::test]
async fn test_submit_then_poll_then_cleanup() {
    let t = engine().await;
    let app = app(&t).await;

    let form = MultipartBody::new()
        .file("file", "clip.mp4", "video/mp4", &video_bytes())
        .text("max_frames", "5")
        .text("wait", "false");
    let (status, body) = send(&app, multipart_post("/predict_video", form)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["kind"], "video");
    let job_id: Uuid = body["job_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(body["status_url"], format!("/status/{job_id}"));

    wait_for_terminal(&t.engine, job_id).await;
    let (status, body) = send(&app, get(&format!("/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["result"]["video_info"]["processed_frames"], 5);

    let cleanup = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/cleanup/{job_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, cleanup).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed_files"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, get(&format!("/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_batch_status_route() {
    let t = engine().await;
    let app = app(&t).await;

    let form = MultipartBody::new()
        .file("files", "a.png", "image/png", &png_bytes(64, 48))
        .file("files", "b.png", "image/png", &corrupt_image_bytes())
        .text("wait", "false");
    let (status, body) = send(&app, multipart_post("/predict_batch", form)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let batch_id: Uuid = body["job_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(body["status_url"], format!("/batch_status/{batch_id}"));

    wait_for_terminal(&t.engine, batch_id).await;
    let (status, body) = send(&app, get(&format!("/batch_status/{batch_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["processed_files"], 2);
    assert_eq!(body["result"]["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stream_requires_url() {
    let t = engine().await;
    let app = app(&t).await;

    let form = MultipartBody::new().text("max_frames", "3");
    let (status, body) = send(&app, multipart_post("/predict_stream", form)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("stream_url"));

    let form = MultipartBody::new()
        .text("stream_url", "rtsp://camera.local/live")
        .text("max_frames", "3");
    let (status, body) = send(&app, multipart_post("/predict_stream", form)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["frames_processed"], 3);
}

#[tokio::test]
async fn test_unknown_job_routes() {
    let t = engine().await;
    let app = app(&t).await;
    let missing = Uuid::new_v4();

    let (status, _) = send(&app, get(&format!("/status/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let cancel = Request::builder()
        .method(Method::POST)
        .uri(format!("/cancel/{missing}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, cancel).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let cleanup = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/cleanup/{missing}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, cleanup).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed_files"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let t = engine().await;
    let app = app(&t).await;
    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
