use crate::config::types::{BackpressureConfig, BackpressureStrategy};
use crate::pipeline::channel::Sender;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

/// What happened to one item offered to the intake queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Sent,
    /// The queue stayed full past the bounded wait; the item was discarded
    Dropped,
    /// The consumer is gone
    Closed,
    Cancelled,
}

/// Producer side of the intake queue, applying the configured backpressure strategy.
pub struct IntakeSender<T> {
    tx: Sender<T>,
    strategy: BackpressureStrategy,
    send_timeout: Duration,
}

impl<T> Clone for IntakeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            strategy: self.strategy,
            send_timeout: self.send_timeout,
        }
    }
}

impl<T: Send> IntakeSender<T> {
    pub fn new(tx: Sender<T>, config: &BackpressureConfig) -> Self {
        Self {
            tx,
            strategy: config.strategy,
            send_timeout: config.send_timeout,
        }
    }

    /// Offer `item` to the queue. Never waits past cancellation, and under the
    /// drop strategy never waits longer than `send_timeout`.
    pub async fn send(&self, item: T, cancel: &CancellationToken) -> IntakeOutcome {
        match self.strategy {
            BackpressureStrategy::Drop => {
                tokio::select! {
                    _ = cancel.cancelled() => IntakeOutcome::Cancelled,
                    result = self.tx.send_timeout(item, self.send_timeout) => match result {
                        Ok(()) => IntakeOutcome::Sent,
                        Err(SendTimeoutError::Timeout(_)) => IntakeOutcome::Dropped,
                        Err(SendTimeoutError::Closed(_)) => IntakeOutcome::Closed,
                    },
                }
            }
            BackpressureStrategy::Block => {
                tokio::select! {
                    _ = cancel.cancelled() => IntakeOutcome::Cancelled,
                    result = self.tx.send(item) => match result {
                        Ok(()) => IntakeOutcome::Sent,
                        Err(_) => IntakeOutcome::Closed,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::create_channel;

    fn config(strategy: BackpressureStrategy, timeout_ms: u64) -> BackpressureConfig {
        BackpressureConfig {
            strategy,
            send_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_drop_after_bounded_wait() {
        let (tx, mut rx) = create_channel::<u32>(1);
        let sender = IntakeSender::new(tx, &config(BackpressureStrategy::Drop, 50));
        let cancel = CancellationToken::new();

        assert_eq!(sender.send(1, &cancel).await, IntakeOutcome::Sent);

        let started = std::time::Instant::now();
        assert_eq!(sender.send(2, &cancel).await, IntakeOutcome::Dropped);
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let (tx, mut rx) = create_channel::<u32>(1);
        let sender = IntakeSender::new(tx, &config(BackpressureStrategy::Block, 10));
        let cancel = CancellationToken::new();

        assert_eq!(sender.send(1, &cancel).await, IntakeOutcome::Sent);

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });

        // Waits past send_timeout without dropping
        assert_eq!(sender.send(2, &cancel).await, IntakeOutcome::Sent);
        assert_eq!(consumer.await.unwrap(), (Some(1), Some(2)));
    }

    #[tokio::test]
    async fn test_block_is_cancellable() {
        let (tx, _rx) = create_channel::<u32>(1);
        let sender = IntakeSender::new(tx, &config(BackpressureStrategy::Block, 10));
        let cancel = CancellationToken::new();
        assert_eq!(sender.send(1, &cancel).await, IntakeOutcome::Sent);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        assert_eq!(sender.send(2, &cancel).await, IntakeOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (tx, rx) = create_channel::<u32>(4);
        drop(rx);
        let sender = IntakeSender::new(tx, &config(BackpressureStrategy::Drop, 10));
        assert_eq!(
            sender.send(1, &CancellationToken::new()).await,
            IntakeOutcome::Closed
        );
    }
}
