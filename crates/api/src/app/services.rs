//! Service handles shared by every route.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use docket_core::JobId;
use docket_infra::config::{DocketConfig, StoreKind};
use docket_infra::jobs::{
    InMemoryJobStore, JobLifecycle, JobSystem, QueryService, SharedJobStore, SqliteJobStore,
    WorkerStatsHandle,
};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::info;

pub type Lifecycle = JobLifecycle<SharedJobStore>;

#[derive(Clone)]
pub struct AppServices {
    lifecycle: Arc<Lifecycle>,
    query: QueryService<SharedJobStore>,
    worker_stats: WorkerStatsHandle,
    sync_wait: Duration,
}

impl AppServices {
    pub fn new(system: &JobSystem<SharedJobStore>, sync_wait: Duration) -> Self {
        Self {
            lifecycle: system.lifecycle().clone(),
            query: system.query().clone(),
            worker_stats: system.worker_stats_handle(),
            sync_wait,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn query(&self) -> &QueryService<SharedJobStore> {
        &self.query
    }

    pub fn worker_stats(&self) -> &WorkerStatsHandle {
        &self.worker_stats
    }

    /// Longest `POST /analyze` waits for a job to finish.
    pub fn sync_wait(&self) -> Duration {
        self.sync_wait
    }
}

/// Open the store selected by the configuration.
pub async fn open_store(config: &DocketConfig) -> anyhow::Result<SharedJobStore> {
    let store: SharedJobStore = match config.store {
        StoreKind::Sqlite => {
            let store = SqliteJobStore::connect(&config.database_url)
                .await
                .with_context(|| format!("failed to open job store at {}", config.database_url))?;
            Arc::new(store)
        }
        StoreKind::Memory => InMemoryJobStore::arc(),
    };
    info!(store = %config.store, "job store ready");
    Ok(store)
}

/// SSE stream of job transitions, optionally limited to one job.
pub fn job_event_stream(
    services: Arc<AppServices>,
    task_id: Option<JobId>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.lifecycle().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if task_id.is_none_or(|id| event.task_id() == id) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(event.kind()).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
