//! Tailing file log source
//!
//! Follows a log file the way `tail -F` follows it, minus the reopen-on-
//! rotation: lines appended after startup are yielded one at a time,
//! truncation rewinds to the start of the file, and everything already in
//! the file when the source is opened is skipped. Wakeups come from a
//! filesystem watcher with a periodic poll as fallback for filesystems
//! where change notification is unreliable.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

use crate::core::LogSource;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct FileLogSource {
    path: PathBuf,
    reader: BufReader<File>,
    /// Byte offset of the next unread byte, tracked to detect truncation.
    position: u64,
    /// Bytes of a line whose terminating newline has not been written yet.
    pending: Vec<u8>,
    events: mpsc::Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl FileLogSource {
    /// Opens `path` for tailing, positioned at the current end of the file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let position = file.seek(SeekFrom::End(0)).await?;

        let (tx, events) = mpsc::channel(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    // An event is only a wakeup; dropping one while the
                    // channel is full loses nothing.
                    let _ = tx.try_send(());
                }
            },
            notify::Config::default(),
        )?;
        // Watch the parent directory so events survive the file being
        // replaced in place.
        let watch_target = path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", watch_target.display()))?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            position,
            pending: Vec::new(),
            events,
            _watcher: watcher,
        })
    }
}

#[async_trait]
impl LogSource for FileLogSource {
    fn path(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let mut chunk = Vec::new();
            let n = self.reader.read_until(b'\n', &mut chunk).await?;
            if n > 0 {
                self.position += n as u64;
                self.pending.extend_from_slice(&chunk);
                if self.pending.ends_with(b"\n") {
                    let mut line = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                // A line still being written; keep accumulating until its
                // newline arrives.
                continue;
            }

            // At end of file. A shrunken file means truncation: start over.
            let len = tokio::fs::metadata(&self.path).await?.len();
            if len < self.position {
                self.position = self.reader.seek(SeekFrom::Start(0)).await?;
                self.pending.clear();
                continue;
            }

            tokio::select! {
                event = self.events.recv() => {
                    if event.is_none() {
                        // Watcher gone; nothing will ever wake us again.
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn yields_lines_appended_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.log");
        std::fs::write(&path, "old line, must be skipped\n").unwrap();

        let mut source = FileLogSource::open(&path).await.unwrap();
        append(&path, "first\nsecond\n");

        let first = timeout(TEST_TIMEOUT, source.read_line()).await.unwrap();
        assert_eq!(first.unwrap(), Some("first".to_string()));
        let second = timeout(TEST_TIMEOUT, source.read_line()).await.unwrap();
        assert_eq!(second.unwrap(), Some("second".to_string()));
    }

    #[tokio::test]
    async fn partial_lines_are_held_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.log");
        std::fs::write(&path, "").unwrap();

        let mut source = FileLogSource::open(&path).await.unwrap();
        append(&path, "incomp");
        append(&path, "lete line\n");

        let line = timeout(TEST_TIMEOUT, source.read_line()).await.unwrap();
        assert_eq!(line.unwrap(), Some("incomplete line".to_string()));
    }

    #[tokio::test]
    async fn truncation_rewinds_to_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.log");
        std::fs::write(&path, "some existing content that makes the file long\n").unwrap();

        let mut source = FileLogSource::open(&path).await.unwrap();

        // Truncate and replace with something shorter than the old offset.
        std::fs::write(&path, "fresh\n").unwrap();

        let line = timeout(TEST_TIMEOUT, source.read_line()).await.unwrap();
        assert_eq!(line.unwrap(), Some("fresh".to_string()));
    }
}
