//! Progress estimation from build output, plus the bounded log buffer.
//!
//! Progress is a heuristic: each line is matched against ordered textual
//! markers and the highest marker seen wins. It never goes backwards.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use super::script_generator::SUCCESS_SENTINEL;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI escape pattern is valid")
});

/// Remove terminal colour/cursor escapes and trailing carriage returns.
pub fn strip_ansi(line: &str) -> String {
    ANSI_REGEX
        .replace_all(line, "")
        .trim_end_matches('\r')
        .to_string()
}

/// Ordered markers: (lowercase needle, progress once seen).
const MARKERS: &[(&str, u8)] = &[
    ("cloning", 10),
    ("restoring cache", 20),
    ("installing dependencies", 30),
    ("building", 60),
    ("copying output", 80),
    ("compiled", 90),
    ("build completed", 95),
    ("saving cache", 95),
];

#[derive(Debug, Default, Clone)]
pub struct ProgressEstimator {
    current: u8,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Feed one line; returns the new value when progress advanced.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let candidate = if line.contains(SUCCESS_SENTINEL) {
            100
        } else {
            let lower = line.to_ascii_lowercase();
            MARKERS
                .iter()
                .filter(|(needle, _)| lower.contains(needle))
                .map(|(_, value)| *value)
                .max()
                .unwrap_or(0)
        };

        if candidate > self.current {
            self.current = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

/// Keeps the most recent `capacity` lines of a stream, counting what it drops.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }

    /// Last line that looks like an error, for failure summaries.
    pub fn last_error_line(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .map(String::as_str)
            .find(|line| {
                let lower = line.to_ascii_lowercase();
                lower.contains("error") || lower.contains("failed") || lower.contains("fatal")
            })
    }

    pub fn into_lines(self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped > 0 {
            out.push(format!("...truncated {} earlier lines...", self.dropped));
        }
        out.extend(self.lines);
        out
    }
}
