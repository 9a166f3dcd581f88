//! Recent subtitle lines, kept independently of the timestamp index, used to
//! build the context window for AI word lookups.

use std::collections::VecDeque;

pub const MAX_RECENT_LINES: usize = 10;
/// Lines of context on each side of the clicked line.
pub const CONTEXT_RADIUS: usize = 2;

#[derive(Debug, Clone)]
pub struct RecentLines {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for RecentLines {
    fn default() -> Self {
        Self::new(MAX_RECENT_LINES)
    }
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append a displayed line. Consecutive repeats are collapsed.
    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || self.lines.back().map(String::as_str) == Some(line) {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Up to [`CONTEXT_RADIUS`] lines before and after `current`, joined by
    /// newlines with `current` in the middle. An unknown line gets the most
    /// recent lines as preceding context.
    pub fn context_window(&self, current: &str) -> String {
        let current = current.trim();
        let Some(pos) = self.lines.iter().rposition(|l| l == current) else {
            let mut parts: Vec<&str> = self
                .lines
                .iter()
                .rev()
                .take(CONTEXT_RADIUS)
                .map(String::as_str)
                .collect();
            parts.reverse();
            parts.push(current);
            return parts.join("\n");
        };
        let start = pos.saturating_sub(CONTEXT_RADIUS);
        let end = (pos + CONTEXT_RADIUS + 1).min(self.lines.len());
        self.lines
            .range(start..end)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
