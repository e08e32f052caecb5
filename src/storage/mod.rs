pub mod checkpoint;
pub mod duckdb;
pub mod traits;

pub use checkpoint::{CheckpointError, CheckpointStore, FileReadState, SharedCheckpoints};
pub use duckdb::DuckDbStorage;
pub use traits::{InsertOutcome, LogStore, StorageError};
