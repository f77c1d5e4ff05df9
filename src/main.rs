use axum::{routing::get, routing::post, Router};
use grading_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgStore},
    routes::{self, metrics::MetricsState},
    services::{
        jobs::JobService,
        queue::{DispatchQueue, RedisDispatchQueue},
    },
    store::StoreSet,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing grading API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis dispatch queue
    tracing::info!("Connecting to Redis dispatch queue");
    let queue: Arc<dyn DispatchQueue> = Arc::new(
        RedisDispatchQueue::new(&config.redis_url, config.payload_ttl())
            .expect("Failed to initialize dispatch queue"),
    );

    let stores = StoreSet::shared(Arc::new(PgStore::new(db_pool.clone())));
    let jobs = JobService::new(stores, queue.clone(), config.stale_after());
    let state = AppState::new(db_pool, queue.clone(), jobs);
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        queue,
    };

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/submissions/{id}/grading",
            post(routes::grading::create_grading_job).get(routes::grading::latest_result),
        )
        .route(
            "/api/v1/submissions/{id}/grading/job",
            get(routes::grading::latest_job_status),
        )
        .route("/api/v1/jobs/recover-stale", post(routes::grading::recover_stale))
        .route("/api/v1/jobs/{job_id}", get(routes::grading::get_job_status))
        .route("/api/v1/jobs/{job_id}/requeue", post(routes::grading::requeue_job))
        .route("/api/v1/queue/overview", get(routes::grading::queue_overview))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting grading API on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
