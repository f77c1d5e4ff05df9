use grading_pipeline::{
    config::AppConfig,
    db::{self, PgStore},
    routes::metrics::describe_metrics,
    services::{
        invoker::{GradingInvoker, ProcessInvoker},
        queue::{DispatchQueue, RedisDispatchQueue},
        recovery::StaleJobRecovery,
        retry::RetryScheduler,
        worker::GradingWorker,
    },
    store::StoreSet,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting grading worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to start Prometheus listener");
        describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue: Arc<dyn DispatchQueue> = Arc::new(
        RedisDispatchQueue::new(&config.redis_url, config.payload_ttl())
            .expect("Failed to initialize dispatch queue"),
    );
    let stores = StoreSet::shared(Arc::new(PgStore::new(db_pool)));
    let invoker: Arc<dyn GradingInvoker> = Arc::new(ProcessInvoker::new(config.invoker_settings()));
    let retry = RetryScheduler::new(queue.clone(), config.retry_policy());
    let recovery = StaleJobRecovery::new(stores.clone(), queue.clone(), config.stale_after());
    let worker = GradingWorker::new(
        stores,
        queue,
        invoker,
        retry.clone(),
        config.worker_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown_rx.clone();
        let interval = config.promote_interval();
        tasks.spawn(async move { retry.run_promoter(interval, shutdown).await });
    }
    {
        let shutdown = shutdown_rx.clone();
        let interval = config.recover_interval();
        tasks.spawn(async move { recovery.run(interval, shutdown).await });
    }

    let concurrency = config.worker_concurrency.max(1);
    for _ in 0..concurrency {
        let worker = worker.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(shutdown).await });
    }

    tracing::info!(concurrency, "Worker ready, consuming grading jobs");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, finishing in-flight jobs");
        }
        Some(result) = tasks.join_next() => {
            tracing::error!(?result, "Worker task exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Grading worker stopped");
}
