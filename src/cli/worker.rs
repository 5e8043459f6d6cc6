//! Daemon entrypoint: configuration, wiring, signals, pool lifetime.

use anyhow::{Context, Result};
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::application::{CommandDispatcher, ProcessorPool};
use crate::domain::ports::{LogSink, MetricsSink};
use crate::infrastructure::amqp::{self, AmqpJobQueue, AmqpLogSink, CommandConsumer};
use crate::infrastructure::backends::ProviderRegistry;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{self, TracingLogSink};
use crate::infrastructure::script::HttpScriptGenerator;
use crate::infrastructure::telemetry::InMemoryMetrics;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run() -> Result<()> {
    let config = ConfigLoader::load()?;
    logging::init(&config)?;
    debug!(?config, "read config");

    let registry = ProviderRegistry::new();
    let provider_config = ConfigLoader::provider_config();
    registry.warn_unknown_options(&config.provider_name, &provider_config);
    let provider = registry
        .create(&config.provider_name, &provider_config)
        .context("couldn't create backend provider")?;

    let generator = Arc::new(
        HttpScriptGenerator::new(&config.build_api_uri)
            .context("couldn't create build script generator")?,
    );

    let connection = Arc::new(amqp::connect(&config.amqp_uri).await?);

    let log_sink: Arc<dyn LogSink> = match config.logs_queue_name {
        Some(ref queue_name) => {
            let channel = connection
                .create_channel()
                .await
                .context("couldn't open log channel")?;
            channel
                .queue_declare(
                    queue_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .context("couldn't declare logs queue")?;
            Arc::new(AmqpLogSink::new(channel, queue_name.clone()))
        }
        None => Arc::new(TracingLogSink),
    };

    let metrics = Arc::new(InMemoryMetrics::new());
    spawn_metrics_reporter(Arc::clone(&metrics));

    let dispatcher = Arc::new(CommandDispatcher::new());
    let (command_tx, command_rx) = mpsc::channel(64);
    let consumer = CommandConsumer::new(Arc::clone(&connection));
    tokio::spawn(async move {
        if let Err(e) = consumer.run(command_tx).await {
            error!(error = %e, "command consumer failed");
        }
    });
    tokio::spawn(Arc::clone(&dispatcher).run(command_rx));

    let queue = Arc::new(AmqpJobQueue::new(
        Arc::clone(&connection),
        config.queue_name.clone(),
    ));

    let pool = Arc::new(ProcessorPool::new(
        queue,
        provider,
        generator,
        log_sink,
        metrics as Arc<dyn MetricsSink>,
        dispatcher,
        config.clone(),
    ));

    spawn_signal_handler(Arc::clone(&pool))?;

    pool.run(config.pool_size).await?;

    if let Err(e) = connection.close(200, "worker shutdown").await {
        error!(error = %e, "couldn't close AMQP connection cleanly");
    }

    Ok(())
}

/// First signal drains gracefully; a second one abandons in-flight work.
fn spawn_signal_handler(pool: Arc<ProcessorPool>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("couldn't install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("couldn't install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("signal received, starting graceful shutdown");

        let drain = pool.graceful_shutdown();
        tokio::pin!(drain);
        tokio::select! {
            _ = &mut drain => {}
            _ = async {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            } => {
                pool.hard_shutdown();
                drain.await;
            }
        }
    });

    Ok(())
}

fn spawn_metrics_reporter(metrics: Arc<InMemoryMetrics>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = metrics.snapshot();
            if !snapshot.is_empty() {
                info!(target: "kiln::metrics", counters = ?snapshot, "metrics report");
            }
        }
    });
}
