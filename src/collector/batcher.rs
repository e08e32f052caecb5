use crate::collector::batch::LogBatch;
use crate::config::types::BatchingConfig;
use crate::delivery::client::{DeliveryError, SendOutcome};
use crate::pipeline::channel::Receiver;
use crate::source::event::LogEvent;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hands a flushed batch to whatever delivers it.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(&self, batch: &LogBatch) -> Result<SendOutcome, DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    pub max_size: usize,
    pub max_wait: Duration,
    pub max_in_flight: usize,
    /// How long in-flight sends may run after shutdown starts
    pub shutdown_grace: Duration,
}

impl BatcherSettings {
    pub fn new(config: &BatchingConfig, shutdown_grace: Duration) -> Self {
        Self {
            max_size: config.max_size,
            max_wait: config.max_wait,
            max_in_flight: config.max_in_flight,
            shutdown_grace,
        }
    }
}

/// Accumulation buffers keyed by source identifier. Every access happens
/// under one lock; batches leave the lock as owned values.
pub struct BatchRegistry {
    max_size: usize,
    buffers: Mutex<HashMap<String, Vec<LogEvent>>>,
}

impl BatchRegistry {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Add an event to its source's buffer. Returns that buffer as a batch
    /// once it has reached `max_size`.
    pub fn append(&self, event: LogEvent) -> Option<LogBatch> {
        let (service, entries) = {
            let mut buffers = self.buffers.lock().unwrap();
            let buffer = buffers.entry(event.service_name.clone()).or_default();
            buffer.push(event);
            if buffer.len() < self.max_size {
                return None;
            }
            let service = buffer[0].service_name.clone();
            (service, std::mem::take(buffer))
        };
        into_batch(service, entries)
    }

    /// Take every non-empty buffer.
    pub fn drain_all(&self) -> Vec<LogBatch> {
        let taken: Vec<(String, Vec<LogEvent>)> = {
            let mut buffers = self.buffers.lock().unwrap();
            buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(service, buffer)| (service.clone(), std::mem::take(buffer)))
                .collect()
        };
        taken
            .into_iter()
            .filter_map(|(service, entries)| into_batch(service, entries))
            .collect()
    }

}

fn into_batch(service: String, entries: Vec<LogEvent>) -> Option<LogBatch> {
    match LogBatch::new(service, entries) {
        Ok(batch) => Some(batch),
        Err(e) => {
            warn!(error = %e, "Discarding invalid batch");
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct BatcherStats {
    pub batches_flushed: AtomicU64,
    pub events_flushed: AtomicU64,
    pub batches_delivered: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub batches_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherCounts {
    pub batches_flushed: u64,
    pub events_flushed: u64,
    pub batches_delivered: u64,
    pub batches_rejected: u64,
    pub batches_failed: u64,
}

impl BatcherStats {
    pub fn snapshot(&self) -> BatcherCounts {
        BatcherCounts {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            events_flushed: self.events_flushed.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Reads events from the intake queue, groups them per source and flushes
/// on size or on a shared `max_wait` ticker. Sends run concurrently, at
/// most `max_in_flight` at a time.
pub struct Batcher {
    registry: BatchRegistry,
    sender: Arc<dyn BatchSender>,
    settings: BatcherSettings,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<()>,
    /// Flushed batches waiting for a send slot
    held: VecDeque<LogBatch>,
    stats: Arc<BatcherStats>,
}

impl Batcher {
    pub fn new(settings: BatcherSettings, sender: Arc<dyn BatchSender>) -> Self {
        Self {
            registry: BatchRegistry::new(settings.max_size),
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            sender,
            settings,
            in_flight: JoinSet::new(),
            held: VecDeque::new(),
            stats: Arc::new(BatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `cancel` fires or the intake queue closes, then flush what
    /// is left and give in-flight sends `shutdown_grace` to finish.
    pub async fn run(mut self, mut rx: Receiver<LogEvent>, cancel: CancellationToken) -> BatcherCounts {
        let mut ticker = tokio::time::interval(self.settings.max_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            max_size = self.settings.max_size,
            max_wait_ms = self.settings.max_wait.as_millis() as u64,
            max_in_flight = self.settings.max_in_flight,
            "Batcher started"
        );

        loop {
            let backlog_full = self.held.len() >= self.settings.max_in_flight.max(1);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Batcher cancelled, flushing");
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned(), if !self.held.is_empty() => {
                    if let (Ok(permit), Some(batch)) = (permit, self.held.pop_front()) {
                        self.spawn_send(batch, permit);
                    }
                }
                Some(result) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    reap(result);
                }
                _ = ticker.tick() => {
                    for batch in self.registry.drain_all() {
                        debug!(service = %batch.service_name, size = batch.len(), "Time threshold reached");
                        self.held.push_back(batch);
                    }
                }
                // Intake pauses only once flushed batches pile up behind busy send slots
                event = rx.recv(), if !backlog_full => match event {
                    Some(event) => {
                        if let Some(batch) = self.registry.append(event) {
                            debug!(service = %batch.service_name, size = batch.len(), "Size threshold reached");
                            self.held.push_back(batch);
                        }
                    }
                    None => {
                        info!("Intake queue closed, flushing");
                        break;
                    }
                },
            }
        }

        self.shutdown(rx).await
    }

    async fn shutdown(mut self, mut rx: Receiver<LogEvent>) -> BatcherCounts {
        // Whatever producers managed to enqueue before stopping
        while let Ok(event) = rx.try_recv() {
            if let Some(batch) = self.registry.append(event) {
                self.held.push_back(batch);
            }
        }
        self.held.extend(self.registry.drain_all());

        let waiting = self.held.len() + self.in_flight.len();
        if waiting > 0 {
            info!(
                held = self.held.len(),
                in_flight = self.in_flight.len(),
                "Flushing remaining batches"
            );
        }

        // Final sends and in-flight sends share one window
        let drained = tokio::time::timeout(self.settings.shutdown_grace, self.finish()).await;

        if drained.is_err() {
            let unsent = self.held.len() as u64;
            self.stats.batches_failed.fetch_add(unsent, Ordering::Relaxed);
            warn!(
                unsent,
                abandoned = self.in_flight.len(),
                "Shutdown window elapsed, abandoning remaining sends"
            );
            self.held.clear();
            self.in_flight.abort_all();
            while self.in_flight.join_next().await.is_some() {}
        }

        let counts = self.stats.snapshot();
        info!(
            batches = counts.batches_flushed,
            events = counts.events_flushed,
            failed = counts.batches_failed,
            "Batcher stopped"
        );
        counts
    }

    /// Send every held batch, then wait for all sends to complete.
    async fn finish(&mut self) {
        while !self.held.is_empty() {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            if let Some(batch) = self.held.pop_front() {
                self.spawn_send(batch, permit);
            }
        }
        while let Some(result) = self.in_flight.join_next().await {
            reap(result);
        }
    }

    fn spawn_send(&mut self, batch: LogBatch, permit: OwnedSemaphorePermit) {
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_flushed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let sender = Arc::clone(&self.sender);
        let stats = Arc::clone(&self.stats);
        self.in_flight.spawn(async move {
            let _permit = permit;
            match sender.send_batch(&batch).await {
                Ok(SendOutcome::Accepted { received }) => {
                    stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(service = %batch.service_name, size = batch.len(), received, "Batch delivered");
                }
                Ok(SendOutcome::Rejected { status, .. }) => {
                    stats.batches_rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(service = %batch.service_name, status, "Batch rejected");
                }
                Err(e) => {
                    stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        service = %batch.service_name,
                        size = batch.len(),
                        error = %e,
                        "Batch send failed, events not requeued"
                    );
                }
            }
        });
    }
}

fn reap(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "Send task panicked");
        }
    }
}
