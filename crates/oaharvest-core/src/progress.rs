//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: one spinner per worker plus an aggregate counter line.
//! Non-TTY mode: hidden bars, periodic log lines carry the numbers.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

fn worker_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {prefix:<24.dim} {wide_msg:.dim}")
        .expect("invalid template")
}

fn counter_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:<10.cyan.bold} {wide_msg}").expect("invalid template")
}

/// Central progress context managing multi-progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Per-worker spinner showing the entry currently being processed.
    ///
    /// Non-TTY: hidden (no-op).
    pub fn worker_bar(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(worker_style());
        // truncate long ids to keep bars aligned
        let display = if name.len() > 24 { &name[..24] } else { name };
        pb.set_prefix(display.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }

    /// Aggregate counter line pinned above the worker spinners.
    pub fn counter_line(&self, prefix: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(counter_style());
        pb.set_prefix(prefix.to_string());
        pb
    }

    /// Print a line above managed progress bars (avoids interference).
    pub fn println(&self, msg: impl AsRef<str>) {
        if self.is_tty {
            let _ = self.multi.println(msg);
        } else {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Whether running in TTY mode.
    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Get reference to `MultiProgress` for the log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for `ProgressContext`.
pub type SharedProgress = Arc<ProgressContext>;

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
