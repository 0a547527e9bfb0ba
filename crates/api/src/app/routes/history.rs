use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::dto::{HistoryParams, HistoryResponse};
use crate::app::errors::{job_error_to_response, json_error, parse_job_id, parse_status};
use crate::app::services::AppServices;

pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(p) => p,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_query", e.body_text()),
    };

    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match parse_status(s) {
            Ok(status) => Some(status),
            Err(resp) => return resp,
        },
        None => None,
    };

    match services.query().get_history(params.limit, status).await {
        Ok(records) => Json(HistoryResponse {
            total: records.len(),
            records,
        })
        .into_response(),
        Err(e) => job_error_to_response(e),
    }
}

pub async fn get_one(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.query().get_one(id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => job_error_to_response(e),
    }
}

pub async fn delete_one(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.query().delete_one(id).await {
        Ok(()) => Json(serde_json::json!({
            "deleted": true,
            "task_id": id,
        }))
        .into_response(),
        Err(e) => job_error_to_response(e),
    }
}
