//! Captured standard output of the guest.

/// Maximum number of captured lines kept per phase.
pub const OUTPUT_LIMIT: usize = 1024;

/// Bounded, ordered buffer of captured output lines.
///
/// There is one buffer per worker, not per call: every check or run phase
/// starts by clearing it, so calls into a worker must be serialized.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Vec<String>,
    /// Lines seen since the last clear, including dropped ones.
    seen: usize,
    limit: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::with_limit(OUTPUT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            seen: 0,
            limit,
        }
    }

    /// Append one line (without its newline).
    ///
    /// Past the limit the first extra line is replaced by the truncation
    /// marker and everything after it is dropped.
    pub fn push_line(&mut self, line: impl Into<String>) {
        self.seen += 1;
        if self.seen <= self.limit {
            self.lines.push(line.into());
        } else if self.seen == self.limit + 1 {
            self.lines.push(truncation_marker(self.limit));
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.seen = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_truncated(&self) -> bool {
        self.seen > self.limit
    }

    /// Captured lines joined with `\n`.
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The sentinel line that replaces output beyond `limit` lines.
pub fn truncation_marker(limit: usize) -> String {
    format!("(Output truncated after {} lines)", limit)
}
