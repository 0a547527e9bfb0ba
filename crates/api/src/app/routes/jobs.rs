use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::time::Instant;

use crate::app::dto::{AnalyzeRequest, StatusResponse, SubmittedResponse};
use crate::app::errors::{job_error_to_response, json_error, parse_job_id};
use crate::app::services::AppServices;
use docket_core::JobStatus;

pub async fn analyze_async(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()),
    };

    match services.lifecycle().submit(body.into()).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(SubmittedResponse::queued(task_id)),
        )
            .into_response(),
        Err(e) => job_error_to_response(e),
    }
}

/// Submit and block until the job settles or the wait budget runs out.
pub async fn analyze(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()),
    };

    let deadline = Instant::now() + services.sync_wait();
    let lifecycle = services.lifecycle();

    let task_id = match lifecycle.submit_wait(body.into(), services.sync_wait()).await {
        Ok(id) => id,
        Err(e) => return job_error_to_response(e),
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    match lifecycle.wait_for_terminal(task_id, remaining).await {
        Ok(Some(record)) if record.status == JobStatus::Completed => {
            (StatusCode::OK, Json(StatusResponse::from(&record))).into_response()
        }
        Ok(Some(record)) => {
            (StatusCode::BAD_GATEWAY, Json(StatusResponse::from(&record))).into_response()
        }
        Ok(None) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({
                "error": "timeout",
                "message": "job did not finish in time; poll the status url",
                "task_id": task_id,
                "status_url": format!("/status/{task_id}"),
            })),
        )
            .into_response(),
        Err(e) => job_error_to_response(e),
    }
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.query().get_one(id).await {
        Ok(record) => Json(StatusResponse::from(&record)).into_response(),
        Err(e) => job_error_to_response(e),
    }
}
