//! Append-only task journal with crash-safe replay.
//!
//! The journal uses JSON Lines: one event per line, each ending in `\n`.
//! Every append is fsynced before the caller mutates in-memory state, so
//! the journal is always at least as new as what the process has observed.
//!
//! # Recovery
//!
//! A crash mid-write leaves at most one torn line at the end of the file.
//! [`Journal::replay`] drops that line and truncates the file to the last
//! complete event. A bad line anywhere else means the file was damaged by
//! something other than a crash, and replay refuses to continue.
//!
//! A write or fsync that fails while the process keeps running is rolled
//! back to the previous length, so the next append never lands behind a
//! partial line.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fsync::{fsync_dir, fsync_file};
use super::{CompSwap, Result, StoreError};
use crate::types::{Task, TaskId};

/// One journal line.
///
/// ```json
/// {"seq":3,"ts":"2025-01-15T10:00:00Z","type":"status_swapped","swap":{...},"ids":["..."]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: JournalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalPayload {
    /// New pending tasks.
    TasksAppended { tasks: Vec<Task> },

    /// A compare-and-swap and the ids it actually changed.
    StatusSwapped { swap: CompSwap, ids: Vec<TaskId> },
}

pub struct Journal {
    file: File,
    path: PathBuf,
    next_seq: u64,
    /// Set when a failed append could not be undone.
    unwritable: bool,
}

impl Journal {
    /// Opens the journal for appending, creating it if needed.
    ///
    /// `next_seq` should come from [`Journal::replay`].
    pub fn open(path: impl AsRef<Path>, next_seq: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        if !existed && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fsync_dir(parent)?;
        }

        Ok(Journal {
            file,
            path,
            next_seq,
            unwritable: false,
        })
    }

    /// Writes and fsyncs one event.
    ///
    /// On failure the file is cut back to its previous length and the
    /// sequence number is not consumed.
    pub fn append(&mut self, payload: JournalPayload) -> Result<JournalEvent> {
        self.append_with(payload, |file, line| {
            file.write_all(line)?;
            fsync_file(file)
        })
    }

    fn append_with(
        &mut self,
        payload: JournalPayload,
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<JournalEvent> {
        if self.unwritable {
            return Err(StoreError::JournalUnwritable(self.path.display().to_string()));
        }

        let event = JournalEvent {
            seq: self.next_seq,
            ts: Utc::now(),
            payload,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let len = self.file.metadata()?.len();
        if let Err(e) = write(&mut self.file, &line) {
            if let Err(rollback) = self.file.set_len(len).and_then(|()| fsync_file(&self.file)) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back journal append"
                );
                self.unwritable = true;
            }
            return Err(e.into());
        }

        self.next_seq += 1;
        Ok(event)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete event, truncating a torn final line.
    ///
    /// Returns `(events, next_seq)`. A missing file replays as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if a line other than the last fails to
    /// parse or sequence numbers are not strictly increasing.
    pub fn replay(path: impl AsRef<Path>) -> Result<(Vec<JournalEvent>, u64)> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok((vec![], 0));
        }

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut events: Vec<JournalEvent> = Vec::new();
        let mut valid_len = 0u64;
        let mut line_no = 0usize;
        let mut torn: Option<(usize, String)> = None;

        loop {
            // Bytes, not `String`: a write cut inside a multi-byte character
            // must read as a torn line rather than an IO error.
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            let blank = line.iter().all(u8::is_ascii_whitespace);

            if let Some((bad_line, details)) = torn.take() {
                // Something follows the bad line, so it was not a torn write.
                if !blank {
                    return Err(StoreError::Corrupt {
                        line: bad_line,
                        details,
                    });
                }
                torn = Some((bad_line, details));
                continue;
            }

            if blank {
                valid_len += n as u64;
                continue;
            }

            if line.last() != Some(&b'\n') {
                torn = Some((line_no, "missing line terminator".to_string()));
                continue;
            }

            match serde_json::from_slice::<JournalEvent>(&line) {
                Ok(event) => {
                    if let Some(prev) = events.last()
                        && event.seq <= prev.seq
                    {
                        return Err(StoreError::Corrupt {
                            line: line_no,
                            details: format!("sequence {} after {}", event.seq, prev.seq),
                        });
                    }
                    events.push(event);
                    valid_len += n as u64;
                }
                Err(e) => torn = Some((line_no, e.to_string())),
            }
        }

        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            fsync_file(&file)?;
        }

        let next_seq = events.last().map(|e| e.seq + 1).unwrap_or(0);
        Ok((events, next_seq))
    }
}
