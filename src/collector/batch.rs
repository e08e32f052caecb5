use crate::source::event::LogEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("service_name is required")]
    MissingServiceName,

    #[error("entries cannot be empty")]
    Empty,

    #[error("entry {index} belongs to '{found}', not '{expected}'")]
    MixedSource {
        index: usize,
        expected: String,
        found: String,
    },
}

/// A group of events for one source, flushed and delivered together.
///
/// This is also the ingestion request body, so a server can deserialize
/// an unchecked value; call [`LogBatch::validate`] before trusting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub entries: Vec<LogEvent>,
}

impl LogBatch {
    /// Build a batch, enforcing a non-empty entry list that all share `service_name`.
    pub fn new(service_name: impl Into<String>, entries: Vec<LogEvent>) -> Result<Self, BatchError> {
        let batch = Self {
            service_name: service_name.into(),
            entries,
        };
        batch.validate()?;
        if let Some((index, entry)) = batch
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.service_name != batch.service_name)
        {
            return Err(BatchError::MixedSource {
                index,
                expected: batch.service_name.clone(),
                found: entry.service_name.clone(),
            });
        }
        Ok(batch)
    }

    /// Checks the wire-level requirements: a source identifier and at least one entry.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.service_name.trim().is_empty() {
            return Err(BatchError::MissingServiceName);
        }
        if self.entries.is_empty() {
            return Err(BatchError::Empty);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
