use std::sync::Arc;

use anyhow::Context;
use docket_analysis::HttpAnalyzer;
use docket_api::app::{self, AppServices, services};
use docket_infra::config::DocketConfig;
use docket_infra::jobs::JobSystem;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    docket_observability::init();

    let config = DocketConfig::from_env().context("invalid configuration")?;

    let store = services::open_store(&config).await?;
    let analyzer = HttpAnalyzer::new(config.analyzer_url.clone());
    tracing::info!(
        analyzer = %analyzer.endpoint(),
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        max_retries = config.max_retries,
        "starting job system"
    );

    let system = JobSystem::start(store, analyzer, config.job_system())
        .await
        .context("failed to start job system")?;

    let services = Arc::new(AppServices::new(&system, config.sync_wait));
    let router = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("http server stopped, draining workers");
    system.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
