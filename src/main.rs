use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use media_detect::app_state::AppState;
use media_detect::config::{AppConfig, StorageBackend};
use media_detect::jobs::DetectionEngine;
use media_detect::routes;
use media_detect::services::detector::{DetectorProfile, HttpDetector};
use media_detect::services::ffmpeg::FfmpegBackend;
use media_detect::services::registry::StatusRegistry;
use media_detect::services::storage::{ArtifactStore, LocalArtifactStore, R2ArtifactStore};

/// Interval between sweeps of expired job statuses.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

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

    tracing::info!("Initializing media-detect server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "detection_job_seconds",
        "Wall-clock time of a detection job, by kind"
    );
    metrics::describe_counter!("detection_jobs_total", "Total detection jobs started");
    metrics::describe_counter!(
        "detection_jobs_completed",
        "Total detection jobs completed"
    );
    metrics::describe_counter!(
        "detection_jobs_failed",
        "Total detection jobs that ended in error"
    );
    metrics::describe_counter!(
        "batch_files_skipped_total",
        "Batch files skipped because they failed to process"
    );
    metrics::describe_counter!(
        "video_frames_processed_total",
        "Video frames run through the detector"
    );
    metrics::describe_gauge!("detection_jobs_active", "Detection jobs currently running");

    // Initialize artifact storage
    let (store, outputs_dir) = match config.storage_backend {
        StorageBackend::Local => {
            tracing::info!(
                uploads = %config.upload_dir.display(),
                outputs = %config.output_dir.display(),
                "Initializing local artifact storage"
            );
            let store = LocalArtifactStore::new(&config.upload_dir, &config.output_dir)
                .await
                .expect("Failed to create storage directories");
            let outputs_dir = store.output_dir().to_path_buf();
            let store: Arc<dyn ArtifactStore> = Arc::new(store);
            (store, Some(outputs_dir))
        }
        StorageBackend::R2 => {
            tracing::info!("Initializing R2 artifact storage");
            let (bucket, endpoint, access_key, secret_key) = config
                .r2_settings()
                .unwrap_or_else(|missing| panic!("{missing} is required for R2 storage"));
            let store = R2ArtifactStore::new(
                bucket,
                endpoint,
                access_key,
                secret_key,
                config.public_base_url.as_deref(),
            )
            .expect("Failed to initialize R2 client");
            let store: Arc<dyn ArtifactStore> = Arc::new(store);
            (store, None)
        }
    };

    // Initialize detector client
    let profile = match &config.classes_file {
        Some(path) => DetectorProfile::from_classes_file(&config.model_name, path)
            .await
            .expect("Failed to load classes file"),
        None => DetectorProfile::coco(&config.model_name),
    };
    tracing::info!(
        detector = %config.detector_url,
        model = %profile.model_name,
        classes = profile.class_names.len(),
        "Initializing detector client"
    );
    let detector = Arc::new(HttpDetector::new(&config.detector_url, profile));

    let video = Arc::new(FfmpegBackend::new(&config.ffmpeg_path, &config.ffprobe_path));

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .expect("Failed to create work directory");

    // Job status registry with periodic eviction of finished jobs
    let registry = Arc::new(StatusRegistry::new(config.status_ttl()));
    let sweeper = registry.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            let evicted = sweeper.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted expired job statuses");
            }
        }
    });

    let engine = DetectionEngine::new(
        registry,
        store,
        detector,
        video,
        config.job_limits(),
        &config.work_dir,
    );
    let state = AppState::new(engine, config.max_upload_bytes);

    let app = routes::router(state, prometheus_handle, outputs_dir)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    tracing::info!("Starting media-detect on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
