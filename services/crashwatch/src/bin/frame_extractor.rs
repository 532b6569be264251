use anyhow::{Context, Result};
use crashwatch::service::{
    init_metrics, init_tracing, load_aws_config, shutdown_signal, start_health_server,
};
use crashwatch::{
    Config, FfmpegExtractor, FrameExtractionHandler, S3BlobStore, SnsNotifier,
    StepFunctionsOrchestrator, TriggerConsumer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration problems surface before any side effect
    let config = Config::load().context("Failed to load configuration")?;
    let settings = Arc::new(config.settings().context("Invalid configuration")?);

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        frame_rate = %settings.frame_rate,
        "Starting frame extractor"
    );

    init_metrics(config.service.metrics_port)?;

    let aws_config = load_aws_config(&config.storage.region).await;

    let handler = Arc::new(FrameExtractionHandler::new(
        settings.clone(),
        Arc::new(S3BlobStore::new(&aws_config, &config.storage)),
        Arc::new(FfmpegExtractor::new(settings.ffmpeg_path.clone())),
        Arc::new(StepFunctionsOrchestrator::new(
            &aws_config,
            settings.state_machine_arn.clone(),
        )),
        Arc::new(SnsNotifier::new(&aws_config, settings.topic_arn.clone())),
    ));

    let consumer = TriggerConsumer::new(&config.kafka, &config.kafka.upload_topic, handler)
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    let consumer_token = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_token).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    let health_port = config.service.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_port, "frame-extractor").await {
            error!(error = %e, "Health server error");
        }
    });

    info!("Frame extractor started successfully");

    shutdown_signal().await;

    info!("Shutting down frame extractor");

    shutdown.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Consumer task failed");
    }
    health_handle.abort();

    info!("Frame extractor stopped");

    Ok(())
}
