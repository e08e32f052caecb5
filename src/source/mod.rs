pub mod event;
pub mod reader;
pub mod watcher;

pub use event::LogEvent;
pub use reader::{FileTailer, ReaderError, WatchPhase};
pub use watcher::{WatchedFile, Watcher, WatcherError};
