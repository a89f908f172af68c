#![cfg(feature = "server")]

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use lexam::{
    ApiKeyConfig, AppState, BillingService, ExamService, ExamType, HttpGrader, HttpPaymentClient,
    SqliteStore,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn api_keys() -> Vec<ApiKeyConfig> {
    vec![
        ApiKeyConfig::new("key-u1", "lx-u1", "u1"),
        ApiKeyConfig::new("key-admin", "lx-admin", "ops").with_admin(),
    ]
}

async fn build_app(dir: &tempfile::TempDir, grading_base: &str) -> (SqliteStore, axum::Router) {
    let store = SqliteStore::new(dir.path().join("lexam.sqlite"));
    store.init().await.expect("init");

    let grader = HttpGrader::new("gk-test")
        .with_base_url(grading_base)
        .with_model("scorer-large");
    let payments = HttpPaymentClient::new("sk-test").with_base_url("http://127.0.0.1:9");
    let exams = ExamService::new(store.clone(), Arc::new(grader));
    let billing = BillingService::new(store.clone(), Arc::new(payments), Vec::new());
    let state = AppState::new(exams, billing)
        .with_api_keys(api_keys())
        .with_webhook_secret("whs_test");
    (store, lexam::http::router(state))
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn seed_writing(store: &SqliteStore, user_id: &str) {
    store.ensure_user(user_id).await.expect("user");
    store
        .apply_grant(user_id, 2, "seed", "ops")
        .await
        .expect("grant");
    store
        .upsert_content_item(
            "w1",
            ExamType::Writing,
            0,
            true,
            json!({"format": "writing", "prompt": "Describe the chart.", "min_words": 150}),
        )
        .await
        .expect("content");
}

async fn seed_speaking(store: &SqliteStore, user_id: &str) {
    store.ensure_user(user_id).await.expect("user");
    store
        .apply_grant(user_id, 2, "seed", "ops")
        .await
        .expect("grant");
    for part in [1u8, 2, 3] {
        store
            .upsert_content_item(
                &format!("s{part}"),
                ExamType::Speaking,
                part,
                true,
                json!({"format": "speaking", "prompt": format!("part {part} question")}),
            )
            .await
            .expect("content");
    }
}

async fn start_exam(app: &axum::Router, exam_type: &str) -> String {
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/v1/exams",
            Some("lx-u1"),
            Some(json!({"exam_type": exam_type})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    read_json(response).await["session_id"]
        .as_str()
        .expect("session id")
        .to_string()
}

#[tokio::test]
async fn writing_submission_is_scored_by_the_grading_service() {
    let grading = MockServer::start();
    let grade_mock = grading.mock(|when, then| {
        when.method(POST)
            .path("/v1/grade")
            .header("authorization", "Bearer gk-test")
            .body_includes("\"exam_type\":\"writing\"")
            .body_includes("\"model\":\"scorer-large\"");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "score": 7.0,
                "sub_scores": {"coherence": 7.0, "grammar": 6.5},
                "feedback": "Clear structure; work on range.",
                "cost_usd_micros": 2150
            }));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let (store, app) = build_app(&dir, &grading.base_url()).await;
    seed_writing(&store, "u1").await;
    let session_id = start_exam(&app, "writing").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/v1/exams/{session_id}/submit"),
            Some("lx-u1"),
            Some(json!({"answers": {"text": "The chart shows a steady rise in usage."}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result = read_json(response).await;
    assert_eq!(result["grading"], json!("subjective"));
    assert_eq!(result["score"], json!(7.0));
    assert_eq!(result["provisional"], json!(false));
    assert_eq!(result["sub_scores"]["grammar"], json!(6.5));
    grade_mock.assert_calls(1);

    let response = app
        .oneshot(request(
            "GET",
            &format!("/v1/exams/{session_id}"),
            Some("lx-u1"),
            None,
        ))
        .await
        .unwrap();
    let session = read_json(response).await;
    assert_eq!(session["status"], json!("completed"));
    assert_eq!(session["ai_cost_usd_micros"], json!(2150));
}

#[tokio::test]
async fn grader_outage_applies_the_fallback_and_completes() {
    let grading = MockServer::start();
    let grade_mock = grading.mock(|when, then| {
        when.method(POST).path("/v1/grade");
        then.status(500).body("internal error");
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let (store, app) = build_app(&dir, &grading.base_url()).await;
    seed_writing(&store, "u1").await;
    let session_id = start_exam(&app, "writing").await;

    let essay = vec!["word"; 180].join(" ");
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/v1/exams/{session_id}/submit"),
            Some("lx-u1"),
            Some(json!({"answers": {"text": essay}})),
        ))
        .await
        .unwrap();
    // Grader failure is not surfaced; the fallback band completes the exam.
    assert_eq!(response.status(), StatusCode::OK);
    let result = read_json(response).await;
    assert_eq!(result["provisional"], json!(true));
    assert_eq!(result["score"], json!(5.0));
    assert!(result["feedback"]
        .as_str()
        .unwrap_or_default()
        .contains("Provisional"));
    grade_mock.assert_calls(1);

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/v1/exams/{session_id}"),
            Some("lx-u1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["status"], json!("completed"));

    let response = app
        .oneshot(request("GET", "/v1/admin/stats", Some("lx-admin"), None))
        .await
        .unwrap();
    let stats = read_json(response).await;
    assert_eq!(stats["grading_fallbacks"], json!(1));
    assert_eq!(stats["exams_completed"], json!(1));
}

#[tokio::test]
async fn speaking_exam_grades_three_parts() {
    let grading = MockServer::start();
    let grade_mock = grading.mock(|when, then| {
        when.method(POST)
            .path("/v1/grade")
            .body_includes("\"exam_type\":\"speaking\"");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "score": 6.5,
                "sub_scores": {"part1": 6.0, "part2": 6.5, "part3": 7.0},
                "feedback": "Good fluency across all parts."
            }));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let (store, app) = build_app(&dir, &grading.base_url()).await;
    seed_speaking(&store, "u1").await;
    let session_id = start_exam(&app, "speaking").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/v1/exams/{session_id}/submit"),
            Some("lx-u1"),
            Some(json!({"answers": {"parts": [
                "I live in a small coastal town.",
                "My favourite season is autumn because...",
                "Cities should invest in public transport."
            ]}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result = read_json(response).await;
    assert_eq!(result["score"], json!(6.5));
    assert_eq!(result["sub_scores"]["part3"], json!(7.0));
    grade_mock.assert_calls(1);
}

#[tokio::test]
async fn malformed_subjective_submission_is_rejected_without_consuming_the_attempt() {
    let grading = MockServer::start();
    let grade_mock = grading.mock(|when, then| {
        when.method(POST).path("/v1/grade");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"score": 6.0, "feedback": "ok"}));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let (store, app) = build_app(&dir, &grading.base_url()).await;
    seed_writing(&store, "u1").await;
    let session_id = start_exam(&app, "writing").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/v1/exams/{session_id}/submit"),
            Some("lx-u1"),
            Some(json!({"answers": {"essay": "wrong field name"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    grade_mock.assert_calls(0);

    // The session stays open and a corrected submission goes through.
    let response = app
        .oneshot(request(
            "POST",
            &format!("/v1/exams/{session_id}/submit"),
            Some("lx-u1"),
            Some(json!({"answers": {"text": "A corrected essay."}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    grade_mock.assert_calls(1);
}
