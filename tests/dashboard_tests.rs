mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gram_lite::dashboard::{router, DashboardState};
use gram_lite::service::GramService;
use test_harness::TestEnv;

async fn create_test_app(env: &TestEnv) -> (Router, GramService) {
    let service = env.service();
    service.start().await.unwrap();
    let app = router(DashboardState {
        service: service.clone(),
    });
    (app, service)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = TestEnv::new();
    let (app, _service) = create_test_app(&env).await;

    let (status, json) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stopping"], false);
    assert_eq!(json["drained"], false);
    assert_eq!(json["requests"], 0);
    assert_eq!(json["lrm_ids"], 0);
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let env = TestEnv::new();
    let (app, _service) = create_test_app(&env).await;

    let (status, json) = get_json(&app, "/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_submit_and_query_job() {
    let env = TestEnv::new();
    let (app, _service) = create_test_app(&env).await;

    let (status, json) = post_json(&app, "/api/jobs", json!({ "lrm_job_id": "61.0,61.1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let contact = json["job_contact"].as_str().unwrap().to_string();

    let (status, jobs) = get_json(&app, "/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_contact"], contact.as_str());
    assert_eq!(jobs[0]["phase"], "poll2");

    let uniq1 = jobs[0]["uniq1"].as_u64().unwrap();
    let uniq2 = jobs[0]["uniq2"].as_u64().unwrap();
    let (status, job) = get_json(&app, &format!("/api/jobs/{uniq1}/{uniq2}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["job_contact"], contact.as_str());
    assert_eq!(job["failure_code"], 0);
    assert_eq!(job["reference_count"], 0);

    let (status, ids) = get_json(&app, "/api/lrm-ids").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids, json!(["61.0", "61.1"]));
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let env = TestEnv::new();
    let (app, _service) = create_test_app(&env).await;

    let (status, json) = get_json(&app, "/api/jobs/1/2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("/1/2/"));
}

#[tokio::test]
async fn test_event_completes_job() {
    let env = TestEnv::new();
    let (app, service) = create_test_app(&env).await;
    let key = service.submit_job("808").await.unwrap();

    let (status, json) = post_json(
        &app,
        "/api/events/808",
        json!({ "outcome": "failed", "failure_code": 4 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_contact"], key.to_string());

    let (status, json) = post_json(&app, "/api/events/808", json!({ "outcome": "done" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_submit_rejected_while_stopping() {
    let env = TestEnv::new();
    let (app, service) = create_test_app(&env).await;
    service
        .manager()
        .stop_all_jobs(gram_lite::registry::StopReason::Shutdown)
        .await;

    let (status, json) = post_json(&app, "/api/jobs", json!({ "lrm_job_id": "1" })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);

    let (_, health) = get_json(&app, "/api/health").await;
    assert_eq!(health["stopping"], true);
    assert_eq!(health["drained"], true);
}
