//! Console Output
//!
//! User-facing lines and the prompt. Diagnostics go through `tracing`
//! instead.

use std::io::Write;

use chrono::Local;
use parking_lot::Mutex;

/// Where command feedback and the prompt are shown
pub trait Console: Send + Sync {
    /// Print one line of feedback
    fn line(&self, text: &str);

    /// Show the prompt (no trailing newline)
    fn prompt(&self, text: &str);
}

/// Timestamped stdout console
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn line(&self, text: &str) {
        println!("[{}] {}", Local::now().format("%H:%M:%S"), text);
    }

    fn prompt(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", text);
        let _ = stdout.flush();
    }
}

/// Console that keeps everything in memory
#[derive(Debug, Default)]
pub struct BufferConsole {
    lines: Mutex<Vec<String>>,
    last_prompt: Mutex<Option<String>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Console for BufferConsole {
    fn line(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }

    fn prompt(&self, text: &str) {
        *self.last_prompt.lock() = Some(text.to_string());
    }
}
