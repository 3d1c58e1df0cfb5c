use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pod_ocr_pipeline::{
    config::AppConfig,
    db::{self, results::PgResultStore},
    services::{encryption::EncryptionService, inference, queue, storage::S3Store},
    worker::{
        pool::{ScalingConfig, WorkerPool},
        WorkerConfig, WorkerContext,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting pod-ocr worker pool");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Expose worker metrics when a scrape address is configured
    if let Some(addr) = &config.worker_metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid worker_metrics_addr");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus metrics exporter");
    }

    // Register application metrics
    metrics::describe_histogram!(
        "pod_processing_seconds",
        "Shared batch inference time attributed to each completed job"
    );
    metrics::describe_counter!("pod_jobs_completed_total", "Total jobs completed");
    metrics::describe_counter!("pod_jobs_retried_total", "Total job attempts requeued");
    metrics::describe_counter!(
        "pod_jobs_dead_lettered_total",
        "Total jobs routed to the dead-letter sink"
    );
    metrics::describe_gauge!(
        "pod_queue_depth",
        "Current number of pending jobs in the queue"
    );
    metrics::describe_gauge!("pod_worker_count", "Current number of live workers");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = S3Store::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    let crypto =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");

    let job_queue = queue::build_queue(&config).expect("Failed to initialize job queue");

    let backend = inference::build_backend(&config).expect("Failed to initialize inference backend");
    tracing::info!(backend = backend.name(), "Inference backend ready");

    let ctx = WorkerContext {
        queue: job_queue,
        store: Arc::new(storage),
        backend,
        results: Arc::new(PgResultStore::new(db_pool)),
        crypto: Arc::new(crypto),
        config: WorkerConfig::from_app_config(&config),
    };
    let scaling = ScalingConfig::from_app_config(&config);

    // Stop cleanly on ctrl-c: cancel the pool and let in-flight cycles finish
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    WorkerPool::new(ctx, scaling).run(shutdown).await;
}
