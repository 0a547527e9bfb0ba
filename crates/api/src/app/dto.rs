use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docket_core::{JobId, JobRecord, JobStatus};
use docket_infra::jobs::{JobStats, SubmitRequest, WorkerStats};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// Handle of the uploaded document.
    pub file_ref: String,
    pub filename: Option<String>,
    pub query: Option<String>,
}

impl From<AnalyzeRequest> for SubmitRequest {
    fn from(body: AnalyzeRequest) -> Self {
        SubmitRequest {
            file_ref: body.file_ref,
            query: body.query,
            filename: body.filename,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventParams {
    pub task_id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmittedResponse {
    pub task_id: JobId,
    pub status: JobStatus,
    pub status_url: String,
}

impl SubmittedResponse {
    pub fn queued(task_id: JobId) -> Self {
        Self {
            task_id,
            status: JobStatus::Queued,
            status_url: format!("/status/{task_id}"),
        }
    }
}

/// `GET /status/:id` and the synchronous analyze response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub task_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub query: String,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl From<&JobRecord> for StatusResponse {
    fn from(record: &JobRecord) -> Self {
        let view = record.status_view();
        Self {
            task_id: view.task_id,
            status: view.status,
            result: view.result,
            error: view.error,
            attempts: record.attempts,
            query: record.query.clone(),
            filename: record.filename.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
            duration_seconds: record.duration_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub total: usize,
    pub records: Vec<JobRecord>,
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub jobs: JobStats,
    pub workers: WorkerStats,
    pub queue: QueueStats,
}
