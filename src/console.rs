//! Diagnostic console
//!
//! The calculation engine reports every notable per-statement outcome as
//! one newline-terminated text line. [`ConsoleLog`] forwards each line to
//! `tracing` and keeps a bounded history for operators.

use heapless::HistoryBuffer;
use parking_lot::Mutex;
use tracing::info;

/// Number of lines kept by [`ConsoleLog`]
pub const CONSOLE_HISTORY: usize = 64;

/// Fire-and-forget line sink
pub trait DiagnosticSink: Send + Sync {
    fn log(&self, line: &str);
}

/// Production sink with bounded history
pub struct ConsoleLog {
    history: Mutex<HistoryBuffer<String, CONSOLE_HISTORY>>,
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HistoryBuffer::new()),
        }
    }

    /// Recent lines, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.history.lock().oldest_ordered().cloned().collect()
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticSink for ConsoleLog {
    fn log(&self, line: &str) {
        info!(target: "console", "{}", line.trim_end());
        self.history.lock().write(line.to_string());
    }
}

/// Sink that records every line, for tests and dry runs
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines that mention a source line number
    pub fn lines_for(&self, line_number: usize) -> Vec<String> {
        let prefix = format!("[line {}]", line_number);
        self.lines
            .lock()
            .iter()
            .filter(|l| l.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

impl DiagnosticSink for MemorySink {
    fn log(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}
