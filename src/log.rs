use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single entry in the replicated log.
///
/// Indices are 1-based and dense. Two entries with the same index and term
/// hold the same command on every server (the Log Matching Property).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("no entry at index {index} with term {term}")]
    BadPrevEntry { index: u64, term: u64 },

    #[error("index {index} precedes commit index {commit_index}")]
    TruncatesCommitted { index: u64, commit_index: u64 },

    #[error("entry index {index} is not contiguous with last index {last}")]
    NonContiguous { index: u64, last: u64 },

    #[error("commit index {index} is beyond last index {last}")]
    CommitOutOfRange { index: u64, last: u64 },

    #[error("apply failed at index {index}: {reason}")]
    Apply { index: u64, reason: String },

    #[error("failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("storage write failed: {0}")]
    Storage(#[from] std::io::Error),
}

pub type ApplyError = Box<dyn std::error::Error + Send + Sync>;

/// State-machine function invoked on each committed command, in index order.
pub type ApplyFn = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, ApplyError> + Send + Sync>;

/// The replicated log: an in-memory entry sequence plus the commit cursor.
///
/// Committed entries are streamed to the sink as JSON lines before the apply
/// function runs, and are never truncated afterwards. The log is only ever
/// touched from the driver task.
pub struct Log {
    entries: Vec<LogEntry>,
    commit_index: u64,
    sink: Box<dyn Write + Send + Sync>,
    apply: ApplyFn,
}

impl Log {
    pub fn new(sink: Box<dyn Write + Send + Sync>, apply: ApplyFn) -> Self {
        Self {
            entries: Vec::new(),
            commit_index: 0,
            sink,
            apply,
        }
    }

    /// Index of the last entry, 0 when empty.
    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Entries strictly after `prev_index`, plus the term of the entry at
    /// `prev_index` (0 when `prev_index` is 0 or unknown).
    pub fn entries_after(&self, prev_index: u64) -> (Vec<LogEntry>, u64) {
        let prev_term = self.get(prev_index).map(|e| e.term).unwrap_or(0);
        let entries = if (prev_index as usize) < self.entries.len() {
            self.entries[prev_index as usize..].to_vec()
        } else {
            Vec::new()
        };
        (entries, prev_term)
    }

    /// The AppendEntries consistency check. Succeeds iff the entry at
    /// `prev_index` carries `prev_term` (or `prev_index` is 0), then drops
    /// every entry after `prev_index` so the leader's entries can be
    /// appended contiguously. Committed entries are never dropped; a correct
    /// leader's probe cannot descend below our commit index.
    pub fn ensure_last_is(&mut self, prev_index: u64, prev_term: u64) -> Result<(), LogError> {
        if prev_index < self.commit_index {
            return Err(LogError::TruncatesCommitted {
                index: prev_index,
                commit_index: self.commit_index,
            });
        }
        if prev_index > self.last_index() {
            return Err(LogError::BadPrevEntry {
                index: prev_index,
                term: prev_term,
            });
        }
        if prev_index > 0 {
            let entry = &self.entries[(prev_index - 1) as usize];
            if entry.term != prev_term {
                return Err(LogError::BadPrevEntry {
                    index: prev_index,
                    term: prev_term,
                });
            }
        }
        if self.last_index() > prev_index {
            tracing::debug!(
                from = prev_index + 1,
                to = self.last_index(),
                "truncating unconfirmed entries"
            );
            self.entries.truncate(prev_index as usize);
        }
        Ok(())
    }

    /// Append one entry; its index must directly follow the last one.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let last = self.last_index();
        if entry.index != last + 1 {
            return Err(LogError::NonContiguous {
                index: entry.index,
                last,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Advance the commit cursor to `index`, persisting and applying each
    /// newly committed entry in order. Calling with an index at or below the
    /// current commit index is a no-op. Returns the apply output of the
    /// entry at `index`, when any entry was newly applied.
    pub fn commit_to(&mut self, index: u64) -> Result<Option<Vec<u8>>, LogError> {
        if index <= self.commit_index {
            return Ok(None);
        }
        if index > self.last_index() {
            return Err(LogError::CommitOutOfRange {
                index,
                last: self.last_index(),
            });
        }

        let mut last_output = None;
        while self.commit_index < index {
            let entry = self.entries[self.commit_index as usize].clone();

            let line = serde_json::to_string(&entry)?;
            self.sink.write_all(line.as_bytes())?;
            self.sink.write_all(b"\n")?;
            self.sink.flush()?;

            let output = (self.apply)(&entry.command).map_err(|e| LogError::Apply {
                index: entry.index,
                reason: e.to_string(),
            })?;

            self.commit_index = entry.index;
            tracing::debug!(index = entry.index, term = entry.term, "committed entry");
            last_output = Some(output);
        }
        Ok(last_output)
    }
}
