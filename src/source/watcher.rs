use crate::config::types::WatcherConfig;
use crate::delivery::retry::RetryPolicy;
use crate::pipeline::backpressure::{IntakeOutcome, IntakeSender};
use crate::source::event::LogEvent;
use crate::source::reader::{FileTailer, ReaderError};
use crate::storage::checkpoint::{self, CheckpointError, CheckpointStore, FileReadState, SharedCheckpoints};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("giving up on '{path}' after {attempts} consecutive read errors: {source}")]
    ReadFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: ReaderError,
    },
}

/// A file to follow and the source identifier its lines are shipped under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub service_name: String,
}

#[derive(Debug, Default)]
pub struct WatcherStats {
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
    pub failed_files: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherCounts {
    pub emitted: u64,
    pub dropped: u64,
    pub failed_files: u64,
}

impl WatcherStats {
    pub fn snapshot(&self) -> WatcherCounts {
        WatcherCounts {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_files: self.failed_files.load(Ordering::Relaxed),
        }
    }
}

/// Runs one tailing task per file, feeds their lines into the intake queue
/// and persists read positions periodically and on shutdown.
pub struct Watcher {
    files: Vec<WatchedFile>,
    hostname: String,
    settings: WatcherConfig,
    intake: IntakeSender<LogEvent>,
    checkpoints: CheckpointStore,
    stats: Arc<WatcherStats>,
}

impl Watcher {
    pub fn new(
        files: Vec<WatchedFile>,
        hostname: impl Into<String>,
        settings: WatcherConfig,
        intake: IntakeSender<LogEvent>,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            files,
            hostname: hostname.into(),
            settings,
            intake,
            checkpoints,
            stats: Arc::new(WatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Watch every file until `cancel` fires. A file whose task fails is
    /// logged and left behind; the others keep running.
    pub async fn run(self, cancel: CancellationToken) -> Result<WatcherCounts, WatcherError> {
        let Watcher {
            files,
            hostname,
            settings,
            intake,
            mut checkpoints,
            stats,
        } = self;

        match checkpoints.load() {
            Ok(_) => {}
            Err(e @ CheckpointError::Corrupt { .. }) => {
                warn!(error = %e, "Ignoring unreadable state file, tailing from end of files");
            }
            Err(e) => return Err(e.into()),
        }

        let shared = checkpoints.shared();
        let mut tasks = Vec::with_capacity(files.len());
        for file in files {
            let key = file.path.to_string_lossy().to_string();
            let saved = checkpoints.get(&key);
            tasks.push(tokio::spawn(watch_file(
                file,
                saved,
                hostname.clone(),
                settings.clone(),
                intake.clone(),
                Arc::clone(&shared),
                Arc::clone(&stats),
                cancel.clone(),
            )));
        }
        // The queue closes once every task has let go of its sender
        drop(intake);

        let mut ticker = tokio::time::interval(checkpoints.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let all_done = join_all(tasks);
        tokio::pin!(all_done);

        let results = loop {
            tokio::select! {
                results = &mut all_done => break results,
                _ = ticker.tick() => {
                    if let Err(e) = checkpoints.save() {
                        warn!(error = %e, "Failed to save state file");
                    }
                }
            }
        };

        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    stats.failed_files.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "File watch task failed");
                }
                Err(e) => {
                    stats.failed_files.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "File watch task panicked");
                }
            }
        }

        checkpoints.save()?;
        let counts = stats.snapshot();
        info!(
            emitted = counts.emitted,
            dropped = counts.dropped,
            failed_files = counts.failed_files,
            state_file = %checkpoints.path().display(),
            "Watcher stopped, state saved"
        );
        Ok(counts)
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_file(
    file: WatchedFile,
    saved: Option<FileReadState>,
    hostname: String,
    settings: WatcherConfig,
    intake: IntakeSender<LogEvent>,
    shared: SharedCheckpoints,
    stats: Arc<WatcherStats>,
    cancel: CancellationToken,
) -> Result<(), WatcherError> {
    let key = file.path.to_string_lossy().to_string();
    let mut tailer = FileTailer::new(&file.path, settings.poll_interval, saved);
    let error_backoff = RetryPolicy {
        max_retries: settings.max_read_errors,
        initial_wait: settings.poll_interval,
        max_wait: settings.poll_interval * 40,
        multiplier: 2.0,
    };
    let mut consecutive_errors = 0u32;

    info!(file = %key, service = %file.service_name, resumed = saved.is_some(), "Watching file");

    // Record the starting position so a restart before the first line
    // does not skip what was written in between
    if let Ok(true) = tailer.attach() {
        checkpoint::record(&shared, &key, tailer.offset(), tailer.inode());
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tailer.next_line() => next,
        };

        match next {
            Ok(Some(line)) => {
                consecutive_errors = 0;
                let line_number = line.line_number;
                let event = LogEvent::new(
                    file.service_name.as_str(),
                    hostname.as_str(),
                    key.as_str(),
                    line.text,
                    line_number,
                );

                match intake.send(event, &cancel).await {
                    IntakeOutcome::Sent => {
                        stats.emitted.fetch_add(1, Ordering::Relaxed);
                    }
                    IntakeOutcome::Dropped => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(file = %key, line_number, "Intake queue full, dropped line");
                    }
                    IntakeOutcome::Closed => {
                        warn!(file = %key, "Intake queue closed, stopping");
                        break;
                    }
                    // Not handed over, so not checkpointed: it is read again next run
                    IntakeOutcome::Cancelled => break,
                }

                checkpoint::record(&shared, &key, line.end_offset, line.inode);
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors > settings.max_read_errors {
                    tailer.stop();
                    return Err(WatcherError::ReadFailed {
                        path: file.path.clone(),
                        attempts: consecutive_errors,
                        source: e,
                    });
                }

                let wait = error_backoff.backoff(consecutive_errors - 1);
                warn!(
                    file = %key,
                    error = %e,
                    attempt = consecutive_errors,
                    wait_ms = wait.as_millis() as u64,
                    "Read failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    tailer.stop();
    debug!(file = %key, "Stopped watching file");
    Ok(())
}
