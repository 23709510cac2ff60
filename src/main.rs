use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use manuscript_convert::{
    app_state::AppState,
    config::{AppConfig, StorageBackend},
    db::{self, PgJobRepository},
    routes,
    services::{
        converter::ConverterRunner,
        notify::TracingNotifier,
        orchestrator::{Orchestrator, OrchestratorConfig},
        relay::{ProgressRelay, RedisTransport},
        state_machine::JobStateMachine,
        storage::{BlobStore, FsBlobStore, R2Client},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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

    tracing::info!("Initializing manuscript-convert server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "conversion_processing_seconds",
        "Wall-clock time of a conversion, from start to finalize"
    );
    metrics::describe_counter!("conversion_jobs_submitted", "Total manuscripts submitted");
    metrics::describe_counter!("conversion_jobs_completed", "Total conversions completed");
    metrics::describe_counter!(
        "conversion_jobs_failed",
        "Total conversions that failed, by error kind"
    );
    metrics::describe_gauge!(
        "conversion_active_runs",
        "Converter processes currently running"
    );

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

    // Initialize blob storage
    let blobs: Arc<dyn BlobStore> = match config.storage_backend {
        StorageBackend::S3 => {
            tracing::info!("Initializing S3 storage client");
            let require = |value: &Option<String>, key: &str| {
                value
                    .clone()
                    .unwrap_or_else(|| panic!("{key} is required when STORAGE_BACKEND=s3"))
            };
            Arc::new(
                R2Client::new(
                    &require(&config.s3_bucket, "S3_BUCKET"),
                    &config.s3_region,
                    &require(&config.s3_endpoint, "S3_ENDPOINT"),
                    &require(&config.s3_access_key, "S3_ACCESS_KEY"),
                    &require(&config.s3_secret_key, "S3_SECRET_KEY"),
                )
                .expect("Failed to initialize S3 client"),
            )
        }
        StorageBackend::Local => {
            tracing::info!(root = %config.local_storage_root.display(), "Initializing local blob storage");
            Arc::new(
                FsBlobStore::new(config.local_storage_root.clone())
                    .await
                    .expect("Failed to initialize local blob storage"),
            )
        }
    };

    // Progress relay, optionally mirrored to Redis pub/sub
    let relay = match &config.redis_url {
        Some(url) => {
            tracing::info!("Publishing progress events to Redis");
            let transport = RedisTransport::spawn(url).expect("Failed to initialize Redis transport");
            Arc::new(ProgressRelay::with_transport(Arc::new(transport)))
        }
        None => Arc::new(ProgressRelay::new()),
    };

    let jobs = JobStateMachine::new(Arc::new(PgJobRepository::new(db_pool)));
    let runner = ConverterRunner::new(config.converter_program.clone(), config.converter_args());

    let orchestrator = Orchestrator::new(
        blobs,
        jobs,
        runner,
        relay,
        Arc::new(TracingNotifier),
        OrchestratorConfig {
            workspace_root: config.workspace_root.clone(),
            max_concurrent_runs: config.max_concurrent_conversions,
            conversion_timeout: config.conversion_timeout(),
        },
    );

    // Pick up where a previous process left off
    orchestrator
        .recover()
        .await
        .expect("Failed to run recovery sweep");

    let state = AppState::new(orchestrator.clone(), config.relay_channel_capacity);
    let app = routes::router(state, Some(prometheus_handle), config.max_upload_bytes);

    tracing::info!("Starting manuscript-convert on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Waiting for in-flight conversions");
    if tokio::time::timeout(DRAIN_TIMEOUT, orchestrator.drain()).await.is_err() {
        tracing::warn!("Conversions still running at shutdown; they will be marked interrupted on next start");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
