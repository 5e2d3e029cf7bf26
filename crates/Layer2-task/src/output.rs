//! Job output capture
//!
//! Provides:
//! - Bounded in-memory buffer of stdout/stderr lines per job
//! - Best-effort progress detection from output lines

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;

/// Default maximum lines kept in memory per job
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Longest progress message kept from an output line
const MAX_PROGRESS_MESSAGE: usize = 120;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    /// Result file name under `results/<id>/`
    pub fn file_name(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout.txt",
            OutputStream::Stderr => "stderr.txt",
        }
    }
}

/// A single captured line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub content: String,
    /// 1-based, across both streams
    pub line_number: usize,
}

/// Output buffer for a single job
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    max_lines: usize,
    line_count: usize,
    stdout_bytes: u64,
    stderr_bytes: u64,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            max_lines: max_lines.max(1),
            line_count: 0,
            stdout_bytes: 0,
            stderr_bytes: 0,
        }
    }

    /// Add a line. `bytes` is the raw size written to the result file.
    pub fn push(&mut self, stream: OutputStream, content: impl Into<String>, bytes: usize) {
        self.line_count += 1;
        match stream {
            OutputStream::Stdout => self.stdout_bytes += bytes as u64,
            OutputStream::Stderr => self.stderr_bytes += bytes as u64,
        }

        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(OutputLine {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
            line_number: self.line_count,
        });
    }

    /// Last `n` lines of one stream, oldest first
    pub fn tail(&self, stream: OutputStream, n: usize) -> Vec<&OutputLine> {
        let mut tail: Vec<&OutputLine> = self
            .lines
            .iter()
            .rev()
            .filter(|l| l.stream == stream)
            .take(n)
            .collect();
        tail.reverse();
        tail
    }

    /// Last `n` stderr lines joined for an error message
    pub fn stderr_tail(&self, n: usize) -> Option<String> {
        let tail = self.tail(OutputStream::Stderr, n);
        if tail.is_empty() {
            return None;
        }
        Some(
            tail.iter()
                .map(|l| l.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines seen, including those evicted
    pub fn total_lines(&self) -> usize {
        self.line_count
    }

    pub fn stdout_bytes(&self) -> u64 {
        self.stdout_bytes
    }

    pub fn stderr_bytes(&self) -> u64 {
        self.stderr_bytes
    }
}

/// Progress signal found in an output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHint {
    pub percentage: Option<u8>,
    pub message: Option<String>,
}

fn percent_regex() -> Option<&'static Regex> {
    static PERCENT: OnceLock<Option<Regex>> = OnceLock::new();
    PERCENT
        .get_or_init(|| Regex::new(r"\b(\d{1,3})(?:\.\d+)?\s?%").ok())
        .as_ref()
}

const PROGRESS_CUES: &[&str] = &[
    "Installing",
    "Building",
    "Compiling",
    "Testing",
    "Downloading",
    "Linking",
    "Bundling",
];

/// Scan a line for `NN%` markers and phase cues
pub fn detect_progress(line: &str) -> Option<ProgressHint> {
    let percentage = percent_regex().and_then(|re| {
        re.captures_iter(line)
            .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
            .filter(|p| *p <= 100)
            .last()
            .map(|p| p as u8)
    });

    let trimmed = line.trim();
    let message = PROGRESS_CUES
        .iter()
        .any(|cue| trimmed.contains(cue))
        .then(|| truncate(trimmed, MAX_PROGRESS_MESSAGE));

    if percentage.is_none() && message.is_none() {
        return None;
    }
    Some(ProgressHint {
        percentage,
        message,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
