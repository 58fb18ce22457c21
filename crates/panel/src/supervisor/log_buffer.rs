use std::collections::VecDeque;

/// Most recent agent output lines, oldest evicted first.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Last `n` lines in order; `0` or an oversized `n` returns everything.
    pub(crate) fn tail(&self, n: usize) -> Vec<String> {
        let n = if n == 0 { self.lines.len() } else { n.min(self.lines.len()) };
        self.lines
            .iter()
            .skip(self.lines.len() - n)
            .cloned()
            .collect()
    }
}
