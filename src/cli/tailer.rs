use crate::cli::{exit_config_not_found, shutdown_signal, Role};
use crate::collector::batcher::{BatchSender, Batcher, BatcherCounts, BatcherSettings};
use crate::config::parse::{load_tailer_config, ConfigError};
use crate::config::types::TailerConfig;
use crate::delivery::client::{DeliveryClient, DeliveryError};
use crate::pipeline::backpressure::IntakeSender;
use crate::pipeline::channel::create_channel;
use crate::source::event::LogEvent;
use crate::source::watcher::{WatchedFile, Watcher, WatcherCounts, WatcherError};
use crate::storage::checkpoint::CheckpointStore;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Extra time past `shutdown_timeout` before the process exits regardless.
const FORCED_EXIT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("delivery setup error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailerSummary {
    pub watcher: WatcherCounts,
    pub batcher: BatcherCounts,
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        exit_config_not_found(Role::Tailer);
    };

    info!(config_path = %config_path.display(), "Loading tailer configuration");
    let config = load_tailer_config(&config_path)?;

    let stop = CancellationToken::new();
    let signalled = stop.clone();
    let grace = config.shutdown_timeout;
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signalled.cancel();

        tokio::time::sleep(grace + FORCED_EXIT_SLACK).await;
        error!("Graceful shutdown stalled, forcing exit");
        std::process::exit(1);
    });

    let summary = run_tailer(config, async move { stop.cancelled().await }).await?;
    info!(
        emitted = summary.watcher.emitted,
        dropped = summary.watcher.dropped,
        batches = summary.batcher.batches_flushed,
        failed_batches = summary.batcher.batches_failed,
        "Tailer shutdown complete"
    );
    Ok(())
}

/// Build the HTTP delivery client (loading TLS material, which is fatal on
/// error) and run the pipeline until `shutdown` resolves.
pub async fn run_tailer(
    config: TailerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<TailerSummary, TailerError> {
    let hard_stop = CancellationToken::new();
    let client = DeliveryClient::from_config(&config)?.with_cancellation(hard_stop.clone());
    info!(server = %client.url(), "Delivery client ready");
    run_pipeline(config, Arc::new(client), hard_stop, shutdown).await
}

/// Wire watcher -> intake queue -> batcher -> `sender` and run until
/// `shutdown` resolves.
///
/// Shutdown order: file tasks stop and persist their offsets, the batcher
/// drains the queue and flushes, in-flight sends get until
/// `shutdown_timeout`, after which `hard_stop` fires and they are abandoned.
pub async fn run_pipeline(
    config: TailerConfig,
    sender: Arc<dyn BatchSender>,
    hard_stop: CancellationToken,
    shutdown: impl Future<Output = ()>,
) -> Result<TailerSummary, TailerError> {
    let (tx, rx) = create_channel::<LogEvent>(config.batching.queue_size);
    let intake = IntakeSender::new(tx, &config.backpressure);

    let files: Vec<WatchedFile> = config
        .enabled_files()
        .into_iter()
        .map(|(path, service_name)| WatchedFile { path, service_name })
        .collect();
    let file_count = files.len();

    let checkpoints = CheckpointStore::new(&config.state_file, config.watcher.checkpoint_interval);
    let watcher = Watcher::new(
        files,
        config.hostname.clone(),
        config.watcher.clone(),
        intake,
        checkpoints,
    );
    let batcher = Batcher::new(
        BatcherSettings::new(&config.batching, config.shutdown_timeout),
        sender,
    );

    let watch_cancel = CancellationToken::new();
    let batch_cancel = CancellationToken::new();
    let watcher_handle = tokio::spawn(watcher.run(watch_cancel.clone()));
    let batcher_handle = tokio::spawn(batcher.run(rx, batch_cancel.clone()));

    info!(
        files = file_count,
        hostname = %config.hostname,
        strategy = ?config.backpressure.strategy,
        "Tailer started, press Ctrl+C to shutdown"
    );

    shutdown.await;
    let deadline = tokio::time::Instant::now() + config.shutdown_timeout;

    watch_cancel.cancel();
    let watched = watcher_handle.await?;

    batch_cancel.cancel();
    let timer_stop = hard_stop.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        timer_stop.cancel();
    });
    let batched = batcher_handle.await?;
    timer.abort();

    Ok(TailerSummary {
        watcher: watched?,
        batcher: batched,
    })
}
