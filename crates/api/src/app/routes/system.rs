use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::dto::{EventParams, QueueStats, StatsResponse};
use crate::app::errors::{job_error_to_response, parse_job_id};
use crate::app::services::{self, AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "docket",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "analyze": "POST /analyze",
            "analyze_async": "POST /analyze/async",
            "status": "GET /status/{task_id}",
            "history": "GET /history?limit=&status=",
            "history_item": "GET|DELETE /history/{task_id}",
            "stats": "GET /stats",
            "events": "GET /events?task_id=",
            "health": "GET /health",
        },
    }))
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.query().stats().await {
        Ok(s) => s,
        Err(e) => return job_error_to_response(e),
    };
    let queue = services.lifecycle().queue();

    Json(StatsResponse {
        jobs,
        workers: services.worker_stats().get(),
        queue: QueueStats {
            depth: queue.depth(),
            capacity: queue.capacity(),
        },
    })
    .into_response()
}

pub async fn events(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<EventParams>,
) -> axum::response::Response {
    let task_id = match params.task_id.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match parse_job_id(s) {
            Ok(id) => Some(id),
            Err(resp) => return resp,
        },
        None => None,
    };

    services::job_event_stream(services, task_id).into_response()
}
