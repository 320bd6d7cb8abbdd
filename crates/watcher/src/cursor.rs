//! Per-file read state for the follow engine.
//!
//! A cursor is created lazily the first time its file enters the follow set
//! and is never destroyed while the file stays followable — dropping a file
//! marks the cursor inactive so the offset survives reselection. All reads
//! are synchronous and bounded; the poll loop wraps them in `spawn_blocking`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, warn};

use codex_view_core::error::TranscriptError;
use codex_view_core::tail::tail_lines;

/// Max bytes consumed per poll, keeping one tick cooperative even when a
/// large backlog appears at once.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// One newly observed transcript line.
#[derive(Debug, Clone)]
pub struct PolledLine {
    pub text: String,
    pub line_number: u64,
    /// True when the line came from the one-time tail replay rather than a
    /// live append.
    pub replay: bool,
}

/// Read-offset and line-count state for one followed file.
#[derive(Debug)]
pub struct FileCursor {
    pub path: PathBuf,
    pub thread_id: String,
    pub offset: u64,
    pub line_number: u64,
    pub active: bool,
    pub last_active_at: Option<Instant>,
    pub initialized: bool,
}

impl FileCursor {
    pub fn new(path: PathBuf, thread_id: String) -> Self {
        Self {
            path,
            thread_id,
            offset: 0,
            line_number: 0,
            active: true,
            last_active_at: None,
            initialized: false,
        }
    }

    /// Poll for new lines.
    ///
    /// First call: seek to EOF and, when `replay_last > 0`, hand back the
    /// last N existing lines flagged as replay. Subsequent calls read only
    /// complete appended lines — a partial line at the tail of an actively
    /// written file stays unconsumed until its newline arrives. A shrunken
    /// file (rotation/replacement) resets the cursor to the start.
    pub fn poll(&mut self, replay_last: usize) -> Result<Vec<PolledLine>, TranscriptError> {
        if !self.initialized {
            return self.initialize(replay_last);
        }

        let mut file = File::open(&self.path).map_err(|e| TranscriptError::io(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| TranscriptError::io(&self.path, e))?
            .len();

        if len < self.offset {
            warn!(
                path = %self.path.display(),
                old_offset = self.offset,
                new_len = len,
                "transcript shrank, re-reading from start"
            );
            self.offset = 0;
            self.line_number = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| TranscriptError::io(&self.path, e))?;
        let to_read = (len - self.offset).min(MAX_READ_BYTES);
        let mut buf = vec![0u8; to_read as usize];
        file.read_exact(&mut buf)
            .map_err(|e| TranscriptError::io(&self.path, e))?;

        // Consume only up to the last complete line.
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(Vec::new()),
        };
        self.offset += consumed as u64;
        self.last_active_at = Some(Instant::now());

        let text = String::from_utf8_lossy(&buf[..consumed]);
        let mut lines = Vec::new();
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            self.line_number += 1;
            lines.push(PolledLine {
                text: line.to_string(),
                line_number: self.line_number,
                replay: false,
            });
        }
        Ok(lines)
    }

    fn initialize(&mut self, replay_last: usize) -> Result<Vec<PolledLine>, TranscriptError> {
        let len = std::fs::metadata(&self.path)
            .map_err(|e| TranscriptError::io(&self.path, e))?
            .len();

        let mut lines = Vec::new();
        if replay_last > 0 {
            let replayed =
                tail_lines(&self.path, replay_last).map_err(|e| TranscriptError::io(&self.path, e))?;
            for line in replayed {
                if line.is_empty() {
                    continue;
                }
                self.line_number += 1;
                lines.push(PolledLine {
                    text: line,
                    line_number: self.line_number,
                    replay: true,
                });
            }
        }

        self.offset = len;
        self.initialized = true;
        self.last_active_at = Some(Instant::now());
        debug!(
            path = %self.path.display(),
            offset = len,
            replayed = lines.len(),
            "cursor initialized"
        );
        Ok(lines)
    }
}
