//! Bounded buffer of the most recent output lines.

use crate::types::OutputLine;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTail {
    capacity: usize,
    lines: VecDeque<OutputLine>,
    /// Lines evicted to stay within `capacity`.
    dropped: u64,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
            dropped: 0,
        }
    }

    /// Append a line, evicting the oldest once full. A zero-capacity tail
    /// retains nothing.
    pub fn push(&mut self, line: OutputLine) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    /// Text of the last `n` lines, oldest first.
    pub fn last_text(&self, n: usize) -> Vec<&str> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).map(|l| l.text.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_lines() {
        let mut tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(OutputLine::stdout(format!("line {i}")));
        }
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.dropped(), 2);
        assert_eq!(tail.last_text(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(tail.last_text(1), vec!["line 4"]);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut tail = OutputTail::new(0);
        tail.push(OutputLine::stderr("lost"));
        assert!(tail.is_empty());
        assert_eq!(tail.dropped(), 1);
    }
}
