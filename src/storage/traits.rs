use crate::collector::batch::LogBatch;
use crate::source::event::LogEvent;
use async_trait::async_trait;

/// Result of persisting one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    /// Events already present from an earlier delivery
    pub duplicates: usize,
}

impl InsertOutcome {
    /// Events the batch is known to have in storage after the insert
    pub fn accepted(&self) -> usize {
        self.inserted + self.duplicates
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist every event of `batch` into its source's collection.
    /// Re-inserting events that are already stored is not an error.
    async fn insert_batch(&self, batch: &LogBatch) -> Result<InsertOutcome, StorageError>;

    /// Delete events older than the retention period. Returns rows removed.
    async fn purge_expired(&self) -> Result<u64, StorageError>;

    async fn count_events(&self, service_name: &str) -> Result<u64, StorageError>;

    /// Newest events of a source, newest first
    async fn recent_events(
        &self,
        service_name: &str,
        limit: usize,
    ) -> Result<Vec<LogEvent>, StorageError>;

    /// Flush pending writes before the process exits.
    async fn close(&self) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to prepare storage directory: {0}")]
    Io(#[from] std::io::Error),
}
