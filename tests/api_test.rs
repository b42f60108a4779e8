mod common;

use avatar_store::routes::routes::routes;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use common::{FakeBackend, Harness, png};
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

const BOUNDARY: &str = "avatar-store-test-boundary";

fn app(h: &Harness) -> Router {
    routes(50 * 1024 * 1024).with_state(h.app_state())
}

fn multipart_upload(uri: &str, filename: &str, media_type: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {media_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn upload(app: &Router, data: &Bytes) -> Value {
    let response = app
        .clone()
        .oneshot(multipart_upload(
            "/upload/pose_image",
            "pose.png",
            "image/png",
            data,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    read_json(response).await
}

#[tokio::test]
async fn healthz_is_ok() {
    let h = Harness::new().await;
    let response = app(&h).oneshot(empty_request("GET", "/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ok");
}

#[tokio::test]
async fn readyz_reports_degraded_backend_without_failing() {
    let h = Harness::with_backend(FakeBackend::failing()).await;
    std::fs::create_dir_all(h.uploads_root()).unwrap();

    let response = app(&h).oneshot(empty_request("GET", "/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["backend"]["ok"], false);
}

#[tokio::test]
async fn upload_twice_returns_same_file_and_download_streams_it() {
    let h = Harness::new().await;
    let app = app(&h);
    let data = png(64, 64, 21);

    let first = upload(&app, &data).await;
    let second = upload(&app, &data).await;
    assert_eq!(first["is_duplicate"], false);
    assert_eq!(second["is_duplicate"], true);
    assert_eq!(first["file_id"], second["file_id"]);
    assert_eq!(first["dimensions"], json!({"width": 64, "height": 64}));

    let id = first["file_id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert!(
        response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("pose.png")
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, data);

    let hash = first["content_hash"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/files/hash/{hash}")))
        .await
        .unwrap();
    let check = read_json(response).await;
    assert_eq!(check["exists"], true);
    assert_eq!(check["file_id"], first["file_id"]);
}

#[tokio::test]
async fn invalid_upload_is_bad_request() {
    let h = Harness::new().await;
    let response = app(&h)
        .oneshot(multipart_upload(
            "/upload/reference_image",
            "notes.txt",
            "text/plain",
            b"hello",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn unknown_hash_does_not_exist() {
    let h = Harness::new().await;
    let digest = "0".repeat(64);
    let response = app(&h)
        .oneshot(empty_request("GET", &format!("/files/hash/{digest}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["exists"], false);
}

#[tokio::test]
async fn backend_failure_still_returns_the_job() {
    let h = Harness::with_backend(FakeBackend::failing()).await;
    let app = app(&h);
    let uploaded = upload(&app, &png(64, 64, 30)).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/generate/avatar",
            json!({
                "prompt": "warrior character, blue armor",
                "pose_file_id": uploaded["file_id"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = read_json(response).await;
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().contains("backend"));
    assert_eq!(job["pose_file_id"], uploaded["file_id"]);
}

#[tokio::test]
async fn referenced_file_needs_force_to_delete() {
    let h = Harness::new().await;
    let app = app(&h);
    let uploaded = upload(&app, &png(64, 64, 31)).await;
    let id = uploaded["file_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/generate_pose?pose=front",
            json!({ "prompt": "archer", "pose_file_id": id }),
        ))
        .await
        .unwrap();
    let job = read_json(response).await;
    assert_eq!(job["status"], "running");
    assert_eq!(job["pose_type"], "front");

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/files/{id}?force=true")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["mode"], "tombstoned");

    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/files/{id}/info")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // deleting the job releases the last claim and purges the tombstone
    let job_id = job["generation_id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/generations/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.store.locate(id.parse().unwrap()).await.unwrap().is_none());
    assert_eq!(h.row_count("blobs").await, 0);
    assert_eq!(common::file_count(h.uploads_root()), 0);
}

#[tokio::test]
async fn unreferenced_file_is_removed() {
    let h = Harness::new().await;
    let app = app(&h);
    let uploaded = upload(&app, &png(64, 64, 32)).await;
    let id = uploaded["file_id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["mode"], "removed");

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/files/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generate_pose_rejects_unknown_view() {
    let h = Harness::new().await;
    let response = app(&h)
        .oneshot(json_request(
            "POST",
            "/generate_pose?pose=diagonal",
            json!({ "prompt": "archer" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generation_with_missing_file_is_not_found() {
    let h = Harness::new().await;
    let response = app(&h)
        .oneshot(json_request(
            "POST",
            "/generate/avatar",
            json!({ "prompt": "archer", "reference_file_id": uuid::Uuid::new_v4() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.row_count("jobs").await, 0);
}

#[tokio::test]
async fn inline_base64_image_is_ingested_and_claimed() {
    use base64::{Engine as _, engine::general_purpose};

    let h = Harness::new().await;
    let data = png(64, 64, 40);
    let inline = format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(&data)
    );

    let response = app(&h)
        .oneshot(json_request(
            "POST",
            "/generate_all_poses",
            json!({ "prompt": "mage", "pose_image": inline }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = read_json(response).await;
    assert_eq!(job["pose_type"], "all");

    let blob_id = job["pose_file_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(h.reference_count(blob_id).await, 1);
}

#[tokio::test]
async fn list_and_get_generations() {
    let h = Harness::new().await;
    let app = app(&h);
    for prompt in ["first knight", "second knight"] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/generate/avatar",
                json!({ "prompt": prompt }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/generations?limit=10"))
        .await
        .unwrap();
    let page = read_json(response).await;
    assert_eq!(page["total"], 2);
    assert_eq!(page["generations"][0]["prompt"], "second knight");

    let id = page["generations"][0]["generation_id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/generations/{id}")))
        .await
        .unwrap();
    let detail = read_json(response).await;
    assert!(detail["job_description"].is_object());

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/generations?status=bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn short_prompt_is_rejected() {
    let h = Harness::new().await;
    let response = app(&h)
        .oneshot(json_request("POST", "/generate/avatar", json!({ "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_reclaim_runs_a_sweep() {
    let h = Harness::new().await;
    let app = app(&h);
    let uploaded = upload(&app, &png(64, 64, 50)).await;
    h.age(uploaded["file_id"].as_str().unwrap().parse().unwrap(), 40)
        .await;

    let response = app
        .clone()
        .oneshot(empty_request("POST", "/admin/reclaim"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["reclaimed"], 1);
    assert_eq!(body["purged"], 0);
    assert_eq!(body["retention_days"], 30);

    let response = app
        .clone()
        .oneshot(empty_request("POST", "/admin/reclaim?retention_days=-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn poses_lists_every_view() {
    let h = Harness::new().await;
    let response = app(&h).oneshot(empty_request("GET", "/poses")).await.unwrap();
    let body = read_json(response).await;
    let names: Vec<&str> = body["poses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["front", "back", "side", "quarter", "all"]);
}
