use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the coordinator itself.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A page of log lines after a cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub lines: Vec<LogLine>,
    /// Pass back as `after` to continue tailing.
    pub next_cursor: u64,
    /// True when lines older than the requested cursor were evicted.
    pub truncated: bool,
}

/// Append-only, bounded run log. Sequence numbers start at 1 and never
/// repeat, so a tailing reader can resume from the last `seq` it saw even
/// after old lines were evicted.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_seq: u64,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            next_seq: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, stream: LogStream, text: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            seq,
            stream,
            text: text.into(),
            at: Utc::now(),
        });
        seq
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of lines ever appended.
    pub fn total(&self) -> u64 {
        self.next_seq - 1
    }

    /// Lines with `seq > after`, at most `limit` of them.
    pub fn tail_after(&self, after: u64, limit: usize) -> LogChunk {
        let first_kept = self.lines.front().map(|l| l.seq).unwrap_or(self.next_seq);
        let lines: Vec<LogLine> = self
            .lines
            .iter()
            .filter(|l| l.seq > after)
            .take(limit)
            .cloned()
            .collect();
        LogChunk {
            next_cursor: lines.last().map(|l| l.seq).unwrap_or(after),
            truncated: after.saturating_add(1) < first_kept,
            lines,
        }
    }
}
