//! Run outcome aggregation shared by the backup and restore pipelines.

use std::fmt;

/// Per-run outcome counts, returned by each pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Identifiers of failed items, in the order they failed
    pub failed_items: Vec<String>,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, item: impl Into<String>) {
        self.failed += 1;
        self.failed_items.push(item.into());
    }

    /// A declined confirmation, counted apart from failures.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Process exit status: non-zero iff something failed.
    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if !self.failed_items.is_empty() {
            write!(f, " (failed: {})", self.failed_items.join(", "))?;
        }
        Ok(())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

/// Format elapsed seconds as human-readable string
pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}
