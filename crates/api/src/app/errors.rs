use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docket_core::{JobId, JobStatus};
use docket_infra::jobs::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::StoreUnavailable(msg) => {
            tracing::error!(error = %msg, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        JobError::QueueFull => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_full",
            "job queue is full, retry later",
        ),
        JobError::QueueClosed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_closed",
            "job queue is shutting down",
        ),
        e @ JobError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        JobError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("task {id} not found"),
        ),
        JobError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid task id"))
}

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: queued, processing, completed, failed",
        )
    })
}
