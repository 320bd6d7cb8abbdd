//! Backward tail read: last `n` lines of a file without loading all of it.
//!
//! Synchronous on purpose — callers on the poll loop wrap file work in
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Chunk size for backward reading.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Read the last `n` lines of `path` in chronological order.
///
/// Seeks to EOF and walks backward in chunks until enough newlines have been
/// seen. A trailing newline at EOF does not produce an empty last line; lines
/// longer than one chunk are assembled correctly; a file with fewer than `n`
/// lines returns all of them.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len == 0 {
        return Ok(Vec::new());
    }

    // n + 1 newlines fully delimit n lines from the end; the extra one is the
    // boundary before the first included line.
    let target_newlines = n + 1;
    let mut newline_count = 0usize;
    let mut collected: Vec<u8> = Vec::new();
    let mut remaining = file_len;

    while remaining > 0 {
        let chunk_len = remaining.min(CHUNK_SIZE);
        let offset = remaining - chunk_len;

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; chunk_len as usize];
        file.read_exact(&mut buf)?;

        newline_count += buf.iter().filter(|&&b| b == b'\n').count();

        buf.append(&mut collected);
        collected = buf;
        remaining = offset;

        if newline_count >= target_newlines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&collected);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let all: Vec<&str> = text.split('\n').collect();
    let start = all.len().saturating_sub(n);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}
