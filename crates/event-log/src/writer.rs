use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::entry::SecurityEvent;

/// Rotate the active log once it grows past this many bytes. One rotated
/// file (`<path>.1`) is kept; an older rotation is overwritten.
const DEFAULT_MAX_LOG_BYTES: u64 = 64 * 1024 * 1024;

/// Errors that can occur during event log I/O.
#[derive(Debug, thiserror::Error)]
pub enum EventWriteError {
    #[error("failed to prepare event log directory {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },

    #[error("failed to open event log {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to serialize security event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("event log write failed: {0}")]
    Write(io::Error),

    #[error("event log rotation failed: {0}")]
    Rotate(io::Error),
}

/// Buffered JSON-lines storage for [`SecurityEvent`] values with size-based
/// rotation.
///
/// Each event becomes exactly one newline-terminated JSON object in the
/// active file. When an append would push the active file past the size cap
/// the file is renamed to `<path>.1` (replacing any previous rotation) and
/// a fresh one is opened, so the log's disk footprint stays bounded at
/// roughly two caps. Writes are buffered; call [`flush`](Self::flush) to
/// make them durable.
pub struct EventWriter {
    path: PathBuf,
    out: BufWriter<File>,
    bytes_written: u64,
    max_bytes: u64,
    events_written: u64,
}

impl EventWriter {
    /// Open (or create) the event log at `path` with the default size cap.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, EventWriteError> {
        Self::with_max_bytes(path, DEFAULT_MAX_LOG_BYTES).await
    }

    /// Open (or create) the event log at `path`, rotating once the active
    /// file exceeds `max_bytes`. Parent directories are created as needed;
    /// an existing file is appended to, with its current size counted
    /// against the cap.
    pub async fn with_max_bytes(
        path: impl AsRef<Path>,
        max_bytes: u64,
    ) -> Result<Self, EventWriteError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| EventWriteError::Prepare {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = open_append(&path).await?;
        let bytes_written = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            out: BufWriter::new(file),
            bytes_written,
            max_bytes,
            events_written: 0,
        })
    }

    /// Serialise `event` as one JSON line and append it, rotating first if
    /// the line would push the active file past the cap.
    pub async fn write(&mut self, event: &SecurityEvent) -> Result<(), EventWriteError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if self.bytes_written > 0 && self.bytes_written + line.len() as u64 > self.max_bytes {
            self.rotate().await?;
        }

        self.out
            .write_all(&line)
            .await
            .map_err(EventWriteError::Write)?;
        self.bytes_written += line.len() as u64;
        self.events_written += 1;

        Ok(())
    }

    /// Flush buffered lines to the underlying file.
    pub async fn flush(&mut self) -> Result<(), EventWriteError> {
        self.out.flush().await.map_err(EventWriteError::Write)
    }

    /// Events written over this writer's lifetime, across rotations.
    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    /// Rename the active file to `<path>.1` and start a fresh one.
    async fn rotate(&mut self) -> Result<(), EventWriteError> {
        self.flush().await?;

        let rotated = rotated_path(&self.path);
        tokio::fs::rename(&self.path, &rotated)
            .await
            .map_err(EventWriteError::Rotate)?;

        let file = open_append(&self.path).await?;
        self.out = BufWriter::new(file);
        self.bytes_written = 0;

        tracing::info!(
            path = %self.path.display(),
            rotated = %rotated.display(),
            "event log rotated"
        );
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<File, EventWriteError> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| EventWriteError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// `events.jsonl` rotates to `events.jsonl.1`.
fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".1");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SecurityEventKind;

    fn event(i: usize) -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventKind::PatternMatch,
            serde_json::json!({"seq": i}),
        )
    }

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut writer = EventWriter::new(&path).await.unwrap();
        writer.write(&event(0)).await.unwrap();
        writer.write(&event(1)).await.unwrap();
        writer.flush().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: SecurityEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.kind, SecurityEventKind::PatternMatch);
        }
        assert_eq!(writer.events_written(), 2);
    }

    #[tokio::test]
    async fn appends_to_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut first = EventWriter::new(&path).await.unwrap();
        first.write(&event(0)).await.unwrap();
        first.flush().await.unwrap();
        drop(first);

        let mut second = EventWriter::new(&path).await.unwrap();
        second.write(&event(1)).await.unwrap();
        second.flush().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn rotates_once_the_size_cap_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        // A cap small enough that every event lands in its own generation.
        let mut writer = EventWriter::with_max_bytes(&path, 64).await.unwrap();
        for i in 0..4 {
            writer.write(&event(i)).await.unwrap();
        }
        writer.flush().await.unwrap();

        let rotated = dir.path().join("events.jsonl.1");
        assert!(rotated.exists(), "rotation file should exist");

        // The active file holds the newest event, the rotation the one
        // before it; everything still parses as JSON lines.
        let active = tokio::fs::read_to_string(&path).await.unwrap();
        let old = tokio::fs::read_to_string(&rotated).await.unwrap();
        assert_eq!(active.lines().count(), 1);
        assert_eq!(old.lines().count(), 1);
        for line in active.lines().chain(old.lines()) {
            let _: SecurityEvent = serde_json::from_str(line).unwrap();
        }

        assert_eq!(writer.events_written(), 4);
    }

    #[tokio::test]
    async fn no_rotation_below_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut writer = EventWriter::with_max_bytes(&path, 1024 * 1024).await.unwrap();
        for i in 0..10 {
            writer.write(&event(i)).await.unwrap();
        }
        writer.flush().await.unwrap();

        assert!(!dir.path().join("events.jsonl.1").exists());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 10);
    }
}
