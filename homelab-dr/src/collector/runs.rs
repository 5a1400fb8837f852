//! Run directories under the storage base: naming, listing and retention.
//!
//! A run directory is named after its start time. Anything in the base
//! directory whose name does not parse as a run timestamp is left alone.

use crate::manifest::{read_manifest, Manifest};
use crate::utils::Result;
use chrono::{Duration, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Run directory and archive timestamp format (local time).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT).ok()
}

/// Create a fresh run directory for `started`.
///
/// When the name is taken (two runs within the same second) the timestamp is
/// advanced one second at a time, so runs never share a directory.
pub fn create_run_dir(base: &Path, started: NaiveDateTime) -> Result<(PathBuf, String)> {
    std::fs::create_dir_all(base)?;

    let mut at = started;
    loop {
        let timestamp = format_timestamp(at);
        let dir = base.join(&timestamp);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((dir, timestamp)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                at += Duration::seconds(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A run directory found under the storage base.
#[derive(Debug)]
pub struct RunListing {
    pub name: String,
    pub path: PathBuf,
    pub manifest: Result<Manifest>,
}

/// Run directories under `base`, oldest first.
pub fn list_runs(base: &Path) -> Result<Vec<RunListing>> {
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if parse_timestamp(&name).is_none() || !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        runs.push(RunListing {
            manifest: read_manifest(&path),
            name,
            path,
        });
    }
    runs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(runs)
}

/// Outcome of a retention pass. Failures are warnings, never run errors.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Delete run directories older than `retention_days` relative to `now`.
///
/// `current` is never removed, whatever its name says.
pub fn prune(base: &Path, retention_days: u32, now: NaiveDateTime, current: &Path) -> PruneReport {
    let mut report = PruneReport::default();
    let cutoff = now - Duration::days(i64::from(retention_days));

    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(base = %base.display(), error = %e, "Retention cleanup could not list backups");
            report.failures.push((base.to_path_buf(), e.to_string()));
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path == current {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(taken) = parse_timestamp(&name) else {
            continue;
        };
        if taken >= cutoff || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(run = %name, "Removed expired backup");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(run = %name, error = %e, "Retention cleanup failed");
                report.failures.push((path, e.to_string()));
            }
        }
    }

    report
}
