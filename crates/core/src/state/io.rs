//! # IO Utilities
//!
//! File primitives the job store is built on: atomic replace for records and
//! bounded tail reads for logs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Chunk size used when scanning a log backwards
const TAIL_CHUNK: u64 = 8 * 1024;

/// Write `content` to `path` so that readers see either the old or the new file
///
/// The content goes to a sibling temp file first, is flushed to disk, and is
/// then renamed over the destination.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp = temp_path_for(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Return at most the last `max_lines` lines of a file
///
/// Only reads as much of the file as needed, so large logs stay cheap.
/// A missing file yields an empty list.
pub fn tail_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();

    // Walk backwards until the buffer holds more newlines than we need
    let mut start = len;
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if buf.iter().filter(|&&b| b == b'\n').count() > max_lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    // The first line is partial when we stopped mid-file
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    Ok(lines)
}

/// Path of the previous log segment after rotation (`output.log.1`)
pub fn rotated_log_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Last `max_lines` lines of a job log, reaching into the rotated segment
/// when the live one is shorter than requested
pub fn tail_log(log_path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    let mut lines = tail_lines(log_path, max_lines)?;
    if lines.len() < max_lines {
        let mut older = tail_lines(&rotated_log_path(log_path), max_lines - lines.len())?;
        older.append(&mut lines);
        lines = older;
    }
    Ok(lines)
}
