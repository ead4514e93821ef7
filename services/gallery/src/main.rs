use anyhow::{Context, Result};
use gallery_events::{declare_topic, EventProducer, EventSubscriber};
use gallery_service::config::{BlobBackend, Config};
use gallery_service::{
    create_router, start_api_server, AppState, BlobStore, GalleryError, IngestService,
    LocalBlobStore, PgRecordStore, PublishRetry, ReplicationHandler, RouterOptions, S3BlobStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting gallery service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Record store
    let records = Arc::new(
        PgRecordStore::connect(&config.database)
            .await
            .map_err(|e| GalleryError::dependency("PostgreSQL", e))?,
    );

    if config.database.run_migrations {
        records
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    // Blob store
    let (blobs, upload_dir) = match config.blobs.backend {
        BlobBackend::Local => {
            let store = LocalBlobStore::new(&config.blobs.upload_dir, config.public_base_url())
                .await
                .context("Failed to initialize upload directory")?;
            let dir = store.root().to_path_buf();
            let store: Arc<dyn BlobStore> = Arc::new(store);
            (store, Some(dir))
        }
        BlobBackend::S3 => {
            let s3 = config
                .blobs
                .s3
                .as_ref()
                .context("S3 backend selected without blobs.s3 settings")?;
            let store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(s3).await);
            (store, None)
        }
    };

    // Event channel
    declare_topic(&config.kafka)
        .await
        .map_err(|e| GalleryError::dependency("Kafka", e))?;

    let producer = Arc::new(
        EventProducer::new(config.kafka.clone()).map_err(|e| GalleryError::dependency("Kafka", e))?,
    );
    producer
        .verify_connectivity()
        .await
        .map_err(|e| GalleryError::dependency("Kafka", e))?;

    let subscriber = EventSubscriber::new(config.kafka.clone())
        .map_err(|e| GalleryError::dependency("Kafka", e))?
        .with_dlq_producer(producer.clone());

    info!(group_id = %subscriber.group_id(), "Subscribed to image events");

    let ingest = Arc::new(IngestService::new(
        blobs,
        records.clone(),
        producer.clone(),
        config.ingest.display_url_template.clone(),
        PublishRetry::with_max_elapsed(config.publish_max_elapsed()),
    ));

    let shutdown = CancellationToken::new();

    // Spawn consumer task; a failure stops the whole process
    let handler = Arc::new(ReplicationHandler::new(records.clone()));
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        let result = subscriber.run(handler, consumer_shutdown.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "Event consumer failed");
            consumer_shutdown.cancel();
        }
        result
    });

    // Spawn API server task
    let router = create_router(
        AppState {
            records: records.clone(),
            ingest: ingest.clone(),
        },
        &config.api,
        &RouterOptions {
            max_upload_bytes: config.ingest.max_upload_bytes,
            upload_dir,
        },
    );
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let result = start_api_server(router, &api_config, api_shutdown.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "API server error");
            api_shutdown.cancel();
        }
        result
    });

    info!("Gallery service started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("Internal failure, shutting down");
        }
    }

    info!("Shutting down gallery service");
    shutdown.cancel();

    let consumer_result = consumer_handle.await.context("Consumer task panicked")?;
    let api_result = api_handle.await.context("API task panicked")?;

    // No new uploads arrive past this point
    let abandoned = ingest.drain(config.shutdown_grace()).await;
    if abandoned > 0 {
        warn!(abandoned, "Events left unpublished at shutdown");
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "Failed to flush pending events");
    }

    info!("Gallery service stopped");

    consumer_result.context("Event consumer failed")?;
    api_result?;

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
