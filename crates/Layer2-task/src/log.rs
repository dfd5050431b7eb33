//! Task Log System - per-task append-only log files
//!
//! Provides:
//! - One file per task under the configured log directory
//! - Line appends serialised per task (one `write` per line)
//! - Bounded tail reads that seek from the end of the file
//! - A [`TaskLogger`] handle that handlers write through

use crate::task::TaskId;
use harbor_foundation::{mask_secrets, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Default number of lines returned by `tail`
pub const DEFAULT_LOG_TAIL_LINES: usize = 200;

/// Upper bound accepted for `tail`
pub const MAX_LOG_TAIL_LINES: usize = 5000;

/// Never scan more than this many bytes from the end of a log
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Read granularity when scanning backwards
const TAIL_BLOCK_SIZE: u64 = 8 * 1024;

/// File-backed log sink shared by the engine and handlers
pub struct TaskLogSink {
    dir: PathBuf,
    writers: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file location. Task ids are validated on construction, so the
    /// path always stays inside the log directory.
    pub fn path(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.log", task_id))
    }

    fn writer_lock(&self, task_id: &TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock();
        Arc::clone(writers.entry(task_id.clone()).or_default())
    }

    /// Append one line. Failures are logged and dropped.
    pub async fn append(&self, task_id: &TaskId, line: &str) {
        if let Err(e) = self.try_append(task_id, line).await {
            warn!(task_id = %task_id, error = %e, "Failed to append task log");
        }
    }

    async fn try_append(&self, task_id: &TaskId, line: &str) -> std::io::Result<()> {
        let lock = self.writer_lock(task_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(task_id))
            .await?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line.trim_end_matches(['\r', '\n']));
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await
    }

    /// Drop the per-task writer lock once the task reached a terminal state
    pub fn release(&self, task_id: &TaskId) {
        self.writers.lock().remove(task_id);
    }

    /// Last `max_lines` lines (each keeps its trailing newline)
    ///
    /// `NotFound` if the task has no log yet.
    pub async fn tail(&self, task_id: &TaskId, max_lines: usize) -> Result<String> {
        let path = self.path(task_id);
        let id = task_id.clone();

        tokio::task::spawn_blocking(move || match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                read_tail(&path, max_lines).map_err(Error::from)
            }
            _ => Err(Error::NotFound(format!("Task log not found: {}", id))),
        })
        .await
        .map_err(|e| Error::Internal(format!("Log reader failed: {}", e)))?
    }
}

/// Scan backwards in blocks until enough newlines are seen or the byte cap is hit
fn read_tail(path: &Path, max_lines: usize) -> std::io::Result<String> {
    if max_lines == 0 {
        return Ok(String::new());
    }

    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let floor = len.saturating_sub(MAX_LOG_BYTES);

    let mut pos = len;
    let mut collected: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // One extra newline guarantees the first kept line is complete.
    while pos > floor && newlines <= max_lines {
        let read = TAIL_BLOCK_SIZE.min(pos - floor);
        pos -= read;

        file.seek(SeekFrom::Start(pos))?;
        let mut block = vec![0u8; read as usize];
        file.read_exact(&mut block)?;

        newlines += block.iter().filter(|b| **b == b'\n').count();
        block.extend_from_slice(&collected);
        collected = block;
    }

    let text = String::from_utf8_lossy(&collected);
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();

    // Stopped at the byte cap: the first fragment is partial unless the cap
    // fell right after a newline.
    if pos > 0
        && lines.len() <= max_lines
        && !lines.is_empty()
        && !at_line_start(&mut file, pos)?
    {
        lines.remove(0);
    }

    let start = lines.len().saturating_sub(max_lines);
    debug!(path = %path.display(), scanned = len - pos, lines = lines.len() - start, "Read log tail");
    Ok(lines[start..].concat())
}

fn at_line_start(file: &mut std::fs::File, pos: u64) -> std::io::Result<bool> {
    if pos == 0 {
        return Ok(true);
    }
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(pos - 1))?;
    file.read_exact(&mut byte)?;
    Ok(byte[0] == b'\n')
}

// ============================================================================
// Task Logger
// ============================================================================

/// Handle bound to one task. Masks registered secrets before writing.
#[derive(Clone)]
pub struct TaskLogger {
    sink: Arc<TaskLogSink>,
    task_id: TaskId,
    secrets: Vec<String>,
}

impl TaskLogger {
    pub fn new(sink: Arc<TaskLogSink>, task_id: TaskId) -> Self {
        Self {
            sink,
            task_id,
            secrets: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Copy of this logger that also masks `secret`
    pub fn with_secret(&self, secret: impl Into<String>) -> Self {
        let mut logger = self.clone();
        let secret = secret.into();
        if !secret.is_empty() {
            logger.secrets.push(secret);
        }
        logger
    }

    /// Apply the registered masks to `text`
    pub fn mask(&self, text: &str) -> String {
        let secrets: Vec<&str> = self.secrets.iter().map(String::as_str).collect();
        mask_secrets(text, &secrets)
    }

    pub async fn line(&self, text: impl AsRef<str>) {
        let masked = self.mask(text.as_ref());
        self.sink.append(&self.task_id, &masked).await;
    }

    /// Log a command line as `$ cmd args...`
    pub async fn command(&self, display: &str) {
        self.line(format!("$ {}", display)).await;
    }
}
