use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hitcount_core::{
    app_config, build_collector, router, ClickHouseClient, HitStorage, MemoryHitStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hitcount_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = app_config::config();
    info!(
        "Starting hit collector on {} ({})",
        config.bind_address, config.environment
    );

    // Storage backend
    let storage: Arc<dyn HitStorage> = if config.uses_clickhouse() {
        let client = ClickHouseClient::from_config();
        client
            .ensure_schema()
            .await
            .context("Failed to prepare ClickHouse schema")?;
        info!("ClickHouse storage initialized");
        Arc::new(client)
    } else {
        warn!("CLICKHOUSE_URL not set, hits are kept in process memory only");
        Arc::new(MemoryHitStorage::new())
    };

    let shutdown = CancellationToken::new();
    let collector = build_collector(&config.collector, storage, shutdown.clone())
        .context("Failed to initialize scheduler metrics")?;

    collector.scheduler.start();

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("Listening on {}", config.bind_address);

    let app = router(
        collector
            .state
            .clone()
            .with_trusted_proxy(config.trust_proxy_headers),
    );
    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = server_shutdown.cancelled() => {},
        }
        server_shutdown.cancel();
    })
    .await
    .context("HTTP server error")?;

    // Wait for in-flight task runs, then flush what is still buffered
    collector.scheduler.shutdown().await;
    match collector.memstore.drain_and_persist().await {
        Ok(count) => info!("Final flush persisted {} hits", count),
        Err(e) => error!(
            "Final flush failed, {} hits lost: {}",
            collector.memstore.len(),
            e
        ),
    }

    Ok(())
}
