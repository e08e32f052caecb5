use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to access state file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file '{path}' is not valid: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Durable read position of one watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReadState {
    /// Byte offset just past the last line handed to the batcher
    pub offset: u64,
    /// Identity of the file the offset refers to (0 when unknown)
    pub inode: u64,
    pub last_read: DateTime<Utc>,
}

/// Shared map of path -> read state. Watch tasks update it in memory; only
/// the owning [`CheckpointStore`] writes it to disk.
pub type SharedCheckpoints = Arc<Mutex<HashMap<String, FileReadState>>>;

/// JSON state file holding every watched file's [`FileReadState`], rewritten
/// wholesale on each save.
pub struct CheckpointStore {
    path: PathBuf,
    states: SharedCheckpoints,
    interval: Duration,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            states: Arc::new(Mutex::new(HashMap::new())),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn shared(&self) -> SharedCheckpoints {
        Arc::clone(&self.states)
    }

    /// Load the state file into memory. A missing file is not an error.
    pub fn load(&self) -> Result<usize> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(state_file = %self.path.display(), "No state file found, starting fresh");
                return Ok(0);
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let loaded: HashMap<String, FileReadState> =
            serde_json::from_slice(&data).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let count = loaded.len();
        *self.states.lock().unwrap() = loaded;
        tracing::info!(state_file = %self.path.display(), files = count, "State loaded");
        Ok(count)
    }

    pub fn get(&self, file: &str) -> Option<FileReadState> {
        self.states.lock().unwrap().get(file).copied()
    }

    /// Write the current states to disk through a temp file and rename,
    /// so a crash mid-write never leaves a truncated state file.
    pub fn save(&mut self) -> Result<()> {
        let data = {
            let states = self.states.lock().unwrap();
            serde_json::to_vec_pretty(&*states).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?
        };

        let io_err = |source: std::io::Error| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, data).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::debug!(state_file = %self.path.display(), "State saved");
        Ok(())
    }
}

/// Record `offset` for `file` in a shared checkpoint map.
pub fn record(states: &SharedCheckpoints, file: &str, offset: u64, inode: u64) {
    states.lock().unwrap().insert(
        file.to_string(),
        FileReadState {
            offset,
            inode,
            last_read: Utc::now(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"), Duration::from_secs(10));
        assert_eq!(store.load().unwrap(), 0);
        assert!(store.get("/var/log/app.log").is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut store = CheckpointStore::new(&path, Duration::from_secs(10));
        record(&store.shared(), "/var/log/app.log", 4096, 1234);
        store.save().unwrap();

        let reloaded = CheckpointStore::new(&path, Duration::from_secs(10));
        assert_eq!(reloaded.load().unwrap(), 1);
        let state = reloaded.get("/var/log/app.log").unwrap();
        assert_eq!(state.offset, 4096);
        assert_eq!(state.inode, 1234);
    }

    #[test]
    fn test_state_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut store = CheckpointStore::new(&path, Duration::from_secs(10));
        record(&store.shared(), "/var/log/app.log", 10, 7);
        store.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &raw["/var/log/app.log"];
        assert_eq!(entry["offset"], 10);
        assert_eq!(entry["inode"], 7);
        assert!(entry["last_read"].is_string());
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = CheckpointStore::new(&path, Duration::from_secs(10));
        assert!(matches!(store.load(), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_record_overwrites_previous_position() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"), Duration::from_secs(10));
        let shared = store.shared();
        record(&shared, "/var/log/app.log", 10, 7);
        record(&shared, "/var/log/app.log", 25, 7);
        assert_eq!(store.get("/var/log/app.log").unwrap().offset, 25);
    }
}
