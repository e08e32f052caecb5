pub mod batch;
pub mod batcher;

pub use batch::{BatchError, LogBatch};
pub use batcher::{BatchSender, Batcher, BatcherCounts, BatcherSettings};
