//! External command runner
//!
//! Spawns `git` / `docker` child processes with piped output, merges stdout
//! and stderr into one line stream, strips ANSI escapes and forwards every
//! line to the task log while it runs.

use crate::log::TaskLogger;
use harbor_foundation::{Error, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines kept in memory for error reports and results
const MAX_CAPTURED_LINES: usize = 200;

/// Lines quoted in a failure message
const ERROR_TAIL_LINES: usize = 20;

/// Description of one child process
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// File piped to stdin (e.g. a build context archive)
    pub stdin_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program args...` as typed on a shell
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `git clone`, `docker compose`: program plus sub-command
    fn short_name(&self) -> String {
        match self.args.first() {
            Some(sub) if !sub.starts_with('-') => format!("{} {}", self.program, sub),
            _ => self.program.clone(),
        }
    }
}

/// Finished process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Last captured output lines (ANSI stripped)
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `n` lines joined with `\n`
    pub fn tail(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].join("\n")
    }

    /// `Handler` error quoting the end of the output on non-zero exit
    pub fn ensure_success(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let tail = self.tail(ERROR_TAIL_LINES);
        Err(Error::Handler(if tail.is_empty() {
            format!("{} failed (exit code {})", what, self.exit_code)
        } else {
            format!("{} failed (exit code {}): {}", what, self.exit_code, tail)
        }))
    }
}

/// Run a command, streaming its output into `log` when given
///
/// The command line itself is logged as `$ ...` (masked by the logger).
/// On timeout the child is killed and `Error::Timeout` is returned.
pub async fn run_streaming(spec: &CommandSpec, log: Option<&TaskLogger>) -> Result<CommandOutput> {
    if let Some(log) = log {
        log.command(&spec.display()).await;
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    match &spec.stdin_file {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?.into_std().await;
            cmd.stdin(Stdio::from(file));
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Runtime(format!("{} command not found", spec.program))
        } else {
            Error::Runtime(format!("Failed to spawn {}: {}", spec.program, e))
        }
    })?;
    debug!(command = %spec.short_name(), pid = ?child.id(), "Spawned process");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut captured: VecDeque<String> = VecDeque::new();
    let run = async {
        while let Some(line) = rx.recv().await {
            if let Some(log) = log {
                log.line(&line).await;
            }
            if captured.len() == MAX_CAPTURED_LINES {
                captured.pop_front();
            }
            captured.push_back(line);
        }
        child.wait().await
    };

    let waited = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, run).await.ok(),
        None => Some(run.await),
    };

    let status = match waited {
        Some(status) => status?,
        None => {
            if let Err(e) = child.kill().await {
                warn!(command = %spec.short_name(), error = %e, "Failed to kill timed out process");
            }
            for pump in pumps {
                pump.abort();
            }
            let message = format!(
                "{} timed out after {}",
                spec.short_name(),
                human_duration(spec.timeout.unwrap_or_default())
            );
            if let Some(log) = log {
                log.line(&message).await;
            }
            return Err(Error::Timeout(message));
        }
    };

    for pump in pumps {
        let _ = pump.await;
    }

    // Killed by signal: no exit code
    let exit_code = status.code().unwrap_or(-1);
    debug!(command = %spec.short_name(), exit_code, "Process exited");

    Ok(CommandOutput {
        exit_code,
        lines: captured.into(),
    })
}

/// Run without logging and fail on non-zero exit
pub async fn capture(spec: &CommandSpec) -> Result<CommandOutput> {
    run_streaming(spec, None).await?.ensure_success(&spec.short_name())
}

/// Read a pipe, emitting one cleaned line per `\n` or `\r`
fn pump_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    flush_line(&mut pending, &tx);
                } else {
                    pending.push(byte);
                }
            }
        }
        flush_line(&mut pending, &tx);
    })
}

fn flush_line(pending: &mut Vec<u8>, tx: &mpsc::UnboundedSender<String>) {
    if pending.is_empty() {
        return;
    }
    let clean = strip_ansi_escapes::strip(&pending[..]);
    pending.clear();
    let line = String::from_utf8_lossy(&clean).trim_end().to_string();
    if !line.trim().is_empty() {
        let _ = tx.send(line);
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}
