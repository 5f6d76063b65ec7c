//! # Job Output
//!
//! Captures a step's stdout and stderr into the job log, optionally echoing
//! it to the caller's terminal. The log is append-only; when it grows past
//! the configured cap it is rotated to `output.log.1` and a fresh segment
//! starts.

use crate::state::io::rotated_log_path;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};

const PUMP_BUFFER: usize = 8 * 1024;

/// Prefix of the lines jobwatch itself writes into a job log
pub const MARKER_PREFIX: &str = "==> [jobwatch]";

/// Append-only log file with size-based rotation
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    at_line_start: bool,
}

impl LogSink {
    /// Open (or create) the log in append mode; `max_bytes == 0` disables rotation
    pub fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            at_line_start: true,
        })
    }

    /// Append output, rotating at the first line boundary past the cap
    ///
    /// A line that outgrows twice the cap without a newline is split.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.over_cap(buf.len()) {
            return self.append(buf);
        }
        if self.at_line_start {
            self.rotate()?;
            return self.append(buf);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.append(&buf[..=end])?;
                self.rotate()?;
                self.append(&buf[end + 1..])
            }
            None if self.written >= self.max_bytes.saturating_mul(2) => {
                self.rotate()?;
                self.append(buf)
            }
            None => self.append(buf),
        }
    }

    fn over_cap(&self, len: usize) -> bool {
        self.max_bytes > 0 && self.written > 0 && self.written + len as u64 > self.max_bytes
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        self.at_line_start = buf.ends_with(b"\n");
        Ok(())
    }

    /// Write a jobwatch marker line, starting a new line if needed
    pub fn marker(&mut self, message: &str) -> io::Result<()> {
        let lead = if self.at_line_start { "" } else { "\n" };
        self.write(format!("{}{} {}\n", lead, MARKER_PREFIX, message).as_bytes())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        std::fs::rename(&self.path, rotated_log_path(&self.path))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        tracing::debug!(path = %self.path.display(), "Rotated job log");
        Ok(())
    }
}

/// Log shared by the stdout and stderr pumps of a running step
pub type SharedLog = Arc<Mutex<LogSink>>;

pub fn shared(sink: LogSink) -> SharedLog {
    Arc::new(Mutex::new(sink))
}

/// Lock the shared log, recovering from a panicked pump
pub fn lock(log: &SharedLog) -> MutexGuard<'_, LogSink> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where a pump mirrors output besides the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    None,
    Stdout,
    Stderr,
}

impl Echo {
    fn write(&self, buf: &[u8]) {
        // The terminal may be gone; the log is what matters
        let _ = match self {
            Echo::None => Ok(()),
            Echo::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(buf).and_then(|_| out.flush())
            }
            Echo::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(buf).and_then(|_| err.flush())
            }
        };
    }
}

/// Copy a child stream into the log until EOF
///
/// Keeps draining after a log write error so the child never blocks on a
/// full pipe.
pub async fn pump<R>(mut reader: R, log: SharedLog, echo: Echo)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut warned = false;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Failed to read job output: {}", e);
                break;
            }
        };
        echo.write(&buf[..n]);
        if let Err(e) = lock(&log).write(&buf[..n]) {
            if !warned {
                tracing::warn!("Failed to write job log: {}", e);
                warned = true;
            }
        }
    }
}
