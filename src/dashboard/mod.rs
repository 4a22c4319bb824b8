use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::GramError;
use crate::registry::{JobKey, RequestSummary};
use crate::service::{GramService, LrmEvent};

#[derive(Clone)]
pub struct DashboardState {
    pub service: GramService,
}

#[derive(Serialize)]
struct HealthResponse {
    stopping: bool,
    drained: bool,
    requests: usize,
    lrm_ids: usize,
}

#[derive(Serialize)]
struct JobResponse {
    job_contact: String,
    uniq1: u64,
    uniq2: u64,
    phase: String,
    failure_code: i32,
    reference_count: usize,
    resident: bool,
}

impl From<RequestSummary> for JobResponse {
    fn from(row: RequestSummary) -> Self {
        Self {
            job_contact: row.key.to_string(),
            uniq1: row.key.uniq1,
            uniq2: row.key.uniq2,
            phase: row.status.phase.to_string(),
            failure_code: row.status.failure_code,
            reference_count: row.reference_count,
            resident: row.resident,
        }
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    lrm_job_id: String,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_contact: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct EventResponse {
    success: bool,
    job_contact: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn status_code(err: &GramError) -> StatusCode {
    match err {
        GramError::JobNotFound(_) | GramError::LrmIdNotFound(_) => StatusCode::NOT_FOUND,
        GramError::LrmIdConflict { .. } | GramError::DuplicateJob(_) => StatusCode::CONFLICT,
        GramError::Stopping | GramError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        GramError::InvalidJobKey(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: GramError) -> Response {
    (
        status_code(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Build the HTTP router without binding it.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:uniq1/:uniq2", get(job_status_handler))
        .route("/api/lrm-ids", get(list_lrm_ids_handler))
        .route("/api/events/:lrm_id", post(event_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.service.manager().snapshot();
    Json(HealthResponse {
        stopping: snapshot.stopping,
        drained: snapshot.drained,
        requests: snapshot.requests,
        lrm_ids: snapshot.lrm_ids,
    })
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .service
        .manager()
        .requests()
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn job_status_handler(
    State(state): State<DashboardState>,
    Path((uniq1, uniq2)): Path<(u64, u64)>,
) -> Response {
    let key = JobKey::new(uniq1, uniq2);
    match state.service.manager().request(&key) {
        Ok(row) => Json(JobResponse::from(row)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_lrm_ids_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut ids = state.service.manager().lrm_ids();
    ids.sort();
    Json(ids)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    match state.service.submit_job(&payload.lrm_job_id).await {
        Ok(key) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_contact: Some(key.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            status_code(&e),
            Json(SubmitJobResponse {
                success: false,
                job_contact: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn event_handler(
    State(state): State<DashboardState>,
    Path(lrm_id): Path<String>,
    Json(event): Json<LrmEvent>,
) -> impl IntoResponse {
    match state.service.deliver_event(&lrm_id, event).await {
        Ok(key) => (
            StatusCode::OK,
            Json(EventResponse {
                success: true,
                job_contact: Some(key.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            status_code(&e),
            Json(EventResponse {
                success: false,
                job_contact: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}
