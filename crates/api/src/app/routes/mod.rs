use axum::{
    Router,
    routing::{get, post},
};

pub mod history;
pub mod jobs;
pub mod system;

/// Router for every job endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/", get(system::index))
        .route("/analyze", post(jobs::analyze))
        .route("/analyze/async", post(jobs::analyze_async))
        .route("/status/:id", get(jobs::status))
        .route("/history", get(history::list))
        .route("/history/:id", get(history::get_one).delete(history::delete_one))
        .route("/stats", get(system::stats))
        .route("/events", get(system::events))
}
