use crate::storage::checkpoint::FileReadState;
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::{sleep, Duration};

/// Longest line handed out in one piece. Anything longer is split.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reader for '{0}' has been stopped")]
    Stopped(PathBuf),
}

/// Where a tailer positions itself the first time it opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPosition {
    /// Resume from a persisted checkpoint, if it still describes the file
    Resume { offset: u64, inode: u64 },
    /// No history: only lines written from now on
    End,
    /// A file that appeared (or was replaced) after we started
    Beginning,
}

/// Lifecycle of one watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Unstarted,
    /// The file does not exist yet
    Waiting,
    /// Positioning the cursor (checkpoint resume, tail, or start of a new file)
    Seeking,
    Streaming,
    /// Identity changed on disk; reattaching to the new file
    Rotating,
    Stopped,
}

/// A complete line read from the file, with the position just past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub text: String,
    pub line_number: u64,
    pub end_offset: u64,
    pub inode: u64,
}

enum Identity {
    Same { len: u64 },
    Replaced,
    Missing,
}

/// Follows a single file: reads complete lines, tracks the byte offset of the
/// last one handed out and reattaches on rotation or truncation.
pub struct FileTailer {
    path: PathBuf,
    poll_interval: Duration,
    start: StartPosition,
    phase: WatchPhase,

    file: Option<BufReader<File>>,
    offset: u64,
    inode: u64,
    line_number: u64,
    /// Bytes of a line whose newline has not been written yet
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl FileTailer {
    /// Create a tailer. With a checkpoint it resumes from the saved offset,
    /// otherwise it starts at end of file.
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        checkpoint: Option<FileReadState>,
    ) -> Self {
        let start = match checkpoint {
            Some(state) => StartPosition::Resume {
                offset: state.offset,
                inode: state.inode,
            },
            None => StartPosition::End,
        };
        Self {
            path: path.into(),
            poll_interval,
            start,
            phase: WatchPhase::Unstarted,
            file: None,
            offset: 0,
            inode: 0,
            line_number: 0,
            pending: Vec::new(),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    /// Byte offset just past the last line returned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn stop(&mut self) {
        self.file = None;
        self.pending.clear();
        self.set_phase(WatchPhase::Stopped);
    }

    /// Open the file now if it exists, so its position can be recorded
    /// before any line arrives. Returns whether a file is attached.
    pub fn attach(&mut self) -> Result<bool, ReaderError> {
        if self.phase == WatchPhase::Stopped {
            return Err(ReaderError::Stopped(self.path.clone()));
        }
        if self.file.is_some() {
            return Ok(true);
        }
        self.open()
    }

    /// Wait for the next complete line. Returns `None` only once stopped.
    pub async fn next_line(&mut self) -> Result<Option<TailedLine>, ReaderError> {
        loop {
            if self.phase == WatchPhase::Stopped {
                return Ok(None);
            }
            if let Some(line) = self.try_next_line()? {
                return Ok(Some(line));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Read the next complete line if one is available right now.
    pub fn try_next_line(&mut self) -> Result<Option<TailedLine>, ReaderError> {
        if self.phase == WatchPhase::Stopped {
            return Err(ReaderError::Stopped(self.path.clone()));
        }

        if self.file.is_none() && !self.open()? {
            return Ok(None);
        }

        if let Some(line) = self.read_complete_line()? {
            return Ok(Some(line));
        }

        // At EOF: has the file been replaced or cut short underneath us?
        match self.identity()? {
            Identity::Same { len } if len < self.offset => {
                tracing::info!(
                    file = %self.path.display(),
                    offset = self.offset,
                    len,
                    "File truncated, reading from start"
                );
                let rewound = match self.file.as_mut() {
                    Some(file) => file.seek(SeekFrom::Start(0)).map(|_| ()),
                    None => Ok(()),
                };
                rewound.map_err(|e| self.io(e))?;
                self.pending.clear();
                self.offset = 0;
                self.line_number = 0;
                self.read_complete_line()
            }
            Identity::Same { .. } | Identity::Missing => Ok(None),
            Identity::Replaced => {
                // Lines the writer finished in the old file before the swap
                if let Some(line) = self.read_complete_line()? {
                    return Ok(Some(line));
                }
                self.set_phase(WatchPhase::Rotating);
                tracing::info!(file = %self.path.display(), "File rotated, reopening");
                self.file = None;
                self.start = StartPosition::Beginning;
                if !self.open()? {
                    return Ok(None);
                }
                self.read_complete_line()
            }
        }
    }

    /// Open the file and position the read cursor. Returns `false` when the
    /// file does not exist yet.
    fn open(&mut self) -> Result<bool, ReaderError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.phase != WatchPhase::Waiting {
                    tracing::info!(file = %self.path.display(), "Waiting for file to appear");
                    self.set_phase(WatchPhase::Waiting);
                }
                // Whatever shows up later is new content
                self.start = StartPosition::Beginning;
                return Ok(false);
            }
            Err(e) => return Err(self.io(e)),
        };

        self.set_phase(WatchPhase::Seeking);
        let metadata = file.metadata().map_err(|e| self.io(e))?;
        let inode = get_inode(&metadata);
        let len = metadata.len();

        let offset = match self.start {
            StartPosition::Resume {
                offset,
                inode: saved,
            } if (saved == 0 || saved == inode) && offset <= len => offset,
            StartPosition::Resume { offset, inode: saved } => {
                tracing::info!(
                    file = %self.path.display(),
                    saved_offset = offset,
                    saved_inode = saved,
                    inode,
                    len,
                    "Checkpoint does not match file on disk, reading from start"
                );
                0
            }
            StartPosition::End => len,
            StartPosition::Beginning => 0,
        };

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io(e))?;

        self.file = Some(reader);
        self.pending.clear();
        self.offset = offset;
        self.inode = inode;
        self.line_number = 0;
        self.start = StartPosition::Beginning;
        self.set_phase(WatchPhase::Streaming);
        tracing::debug!(file = %self.path.display(), offset, inode, "Opened file");
        Ok(true)
    }

    /// Read one newline-terminated line. A partial trailing line is held
    /// in `pending` until its newline arrives or it reaches
    /// `max_line_bytes`, at which point it is handed out as is.
    fn read_complete_line(&mut self) -> Result<Option<TailedLine>, ReaderError> {
        let Some(reader) = self.file.as_mut() else {
            return Ok(None);
        };

        let room = self.max_line_bytes.saturating_sub(self.pending.len()) as u64;
        let read = reader.by_ref().take(room).read_until(b'\n', &mut self.pending);
        if let Err(e) = read {
            return Err(self.io(e));
        }

        let complete = self.pending.last() == Some(&b'\n');
        if !complete && self.pending.len() < self.max_line_bytes {
            return Ok(None);
        }
        if !complete {
            tracing::warn!(
                file = %self.path.display(),
                max_line_bytes = self.max_line_bytes,
                "Line exceeds maximum length, splitting"
            );
        }

        let buf = std::mem::take(&mut self.pending);
        self.offset += buf.len() as u64;
        self.line_number += 1;

        let text = String::from_utf8_lossy(&buf)
            .trim_end_matches(&['\n', '\r'][..])
            .to_string();

        Ok(Some(TailedLine {
            text,
            line_number: self.line_number,
            end_offset: self.offset,
            inode: self.inode,
        }))
    }

    fn identity(&self) -> Result<Identity, ReaderError> {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => {
                let current = get_inode(&metadata);
                if self.inode != 0 && current != 0 && current != self.inode {
                    Ok(Identity::Replaced)
                } else {
                    Ok(Identity::Same {
                        len: metadata.len(),
                    })
                }
            }
            // Renamed away and not yet recreated; keep the old handle
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Identity::Missing),
            Err(e) => Err(self.io(e)),
        }
    }

    fn set_phase(&mut self, phase: WatchPhase) {
        if self.phase != phase {
            tracing::debug!(file = %self.path.display(), from = ?self.phase, to = ?phase, "Watch phase changed");
            self.phase = phase;
        }
    }

    fn io(&self, source: std::io::Error) -> ReaderError {
        ReaderError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn get_inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

// No stable file identity here; 0 disables identity checks and leaves
// truncation detection to the size comparison.
#[cfg(not(unix))]
fn get_inode(_metadata: &Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn tailer(path: &Path, checkpoint: Option<FileReadState>) -> FileTailer {
        FileTailer::new(path, Duration::from_millis(10), checkpoint)
    }

    fn texts(tailer: &mut FileTailer) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = tailer.try_next_line().unwrap() {
            out.push(line.text);
        }
        out
    }

    #[test]
    fn test_no_checkpoint_starts_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old 1\nold 2\n");

        let mut tailer = tailer(&path, None);
        assert!(tailer.try_next_line().unwrap().is_none());
        assert_eq!(tailer.phase(), WatchPhase::Streaming);

        append(&path, "new 1\n");
        let line = tailer.try_next_line().unwrap().unwrap();
        assert_eq!(line.text, "new 1");
        assert_eq!(line.line_number, 1);
        assert_eq!(line.end_offset, 18);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\nsecond\nthird\n");

        let mut reader = tailer(&path, None);
        reader.try_next_line().unwrap();
        let inode = reader.inode();

        let checkpoint = FileReadState {
            offset: 6,
            inode,
            last_read: Utc::now(),
        };
        let mut resumed = tailer(&path, Some(checkpoint));
        assert_eq!(texts(&mut resumed), vec!["second", "third"]);
        assert_eq!(resumed.offset(), 19);
    }

    #[test]
    fn test_stale_checkpoint_reads_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\nb\n");

        let checkpoint = FileReadState {
            offset: 500,
            inode: 0,
            last_read: Utc::now(),
        };
        let mut reader = tailer(&path, Some(checkpoint));
        assert_eq!(texts(&mut reader), vec!["a", "b"]);
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        append(&path, "complete\npart");
        assert_eq!(texts(&mut reader), vec!["complete"]);
        assert_eq!(reader.offset(), 9);

        append(&path, "ial\r\n");
        let line = reader.try_next_line().unwrap().unwrap();
        assert_eq!(line.text, "partial");
        assert_eq!(line.line_number, 2);
        assert_eq!(line.end_offset, 18);
    }

    #[test]
    fn test_partial_line_kept_across_polls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        for chunk in ["a", "b", "c"] {
            append(&path, chunk);
            assert!(reader.try_next_line().unwrap().is_none());
        }
        assert_eq!(reader.offset(), 0);

        append(&path, "\n");
        assert_eq!(texts(&mut reader), vec!["abc"]);
        assert_eq!(reader.offset(), 4);
    }

    #[test]
    fn test_overlong_line_is_split() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        reader.max_line_bytes = 8;
        append(&path, "0123456789abcdefXYZ");

        // No newline yet, but the reader never holds more than the cap
        assert_eq!(texts(&mut reader), vec!["01234567", "89abcdef"]);
        assert_eq!(reader.offset(), 16);
        assert_eq!(reader.pending.len(), 3);

        append(&path, "\nnext\n");
        let tail = reader.try_next_line().unwrap().unwrap();
        assert_eq!(tail.text, "XYZ");
        assert_eq!(tail.line_number, 3);
        assert_eq!(tail.end_offset, 20);
        assert_eq!(texts(&mut reader), vec!["next"]);
    }

    #[test]
    fn test_truncation_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        append(&path, "one\ntwo\nthree\n");
        assert_eq!(texts(&mut reader).len(), 3);

        std::fs::write(&path, "x\n").unwrap();
        let line = reader.try_next_line().unwrap().unwrap();
        assert_eq!(line.text, "x");
        assert_eq!(line.line_number, 1);
        assert_eq!(line.end_offset, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        append(&path, "before 1\nbefore 2\n");
        assert_eq!(texts(&mut reader), vec!["before 1", "before 2"]);
        let old_inode = reader.inode();

        // Late write to the old file, then the swap
        append(&path, "before 3\n");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "after 1\n");

        assert_eq!(texts(&mut reader), vec!["before 3", "after 1"]);
        assert_ne!(reader.inode(), old_inode);
        assert_eq!(reader.offset(), 8);
        assert_eq!(reader.phase(), WatchPhase::Streaming);
    }

    #[test]
    fn test_missing_file_read_from_start_when_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.log");

        let mut reader = tailer(&path, None);
        assert!(reader.try_next_line().unwrap().is_none());
        assert_eq!(reader.phase(), WatchPhase::Waiting);

        append(&path, "hello\n");
        assert_eq!(texts(&mut reader), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_next_line_follows_growth() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = tailer(&path, None);
        assert!(reader.try_next_line().unwrap().is_none());

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            append(&writer_path, "late line\n");
        });

        let line = tokio::time::timeout(Duration::from_secs(2), reader.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "late line");
    }

    #[test]
    fn test_stopped_reader_errors() {
        let dir = TempDir::new().unwrap();
        let mut reader = tailer(&dir.path().join("a.log"), None);
        reader.stop();
        assert!(matches!(
            reader.try_next_line(),
            Err(ReaderError::Stopped(_))
        ));
    }
}
