//! HTTP adapter for an analysis service running out of process.
//!
//! Wire format:
//!
//! ```text
//! POST {endpoint}
//! {"task_id": "...", "file_ref": "...", "query": "..."}
//!
//! 200 {"status": "success", "result": "..."}
//! 200 {"status": "error", "error": "..."}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::analyzer::{AnalysisRequest, Analyzer};
use crate::error::AnalysisError;

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    status: String,
    result: Option<String>,
    error: Option<String>,
}

/// Calls a remote analysis service over HTTP.
///
/// No client-side timeout is configured; attempt deadlines are enforced by
/// the retry controller.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        debug!(task_id = %request.task_id, endpoint = %self.endpoint, "calling analysis service");

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Failed(format!(
                "service returned {status}: {}",
                body.trim()
            )));
        }

        let body: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

        match body.status.as_str() {
            "success" => body
                .result
                .ok_or_else(|| AnalysisError::InvalidResponse("success without result".into())),
            "error" => Err(AnalysisError::Failed(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            other => Err(AnalysisError::InvalidResponse(format!(
                "unexpected status '{other}'"
            ))),
        }
    }
}
