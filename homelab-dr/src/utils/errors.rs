//! Error taxonomy for backup and restore runs.
//!
//! Manifest errors abort a restore before anything is planned. Every other
//! variant is scoped to a single action and ends up in the run summary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrError {
    #[error("Manifest not found: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("Unsupported manifest version: {}", version_label(.0))]
    UnsupportedManifestVersion(Option<u64>),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Selector {selector} matched {matches} pods")]
    AmbiguousSelector { selector: String, matches: usize },

    #[error("Transfer failed on {target}: {message}")]
    TransferFailure { target: String, message: String },

    #[error("Archive missing from backup: {}", .0.display())]
    ArchiveMissing(PathBuf),

    #[error("Archive name already used in this run: {0}")]
    DuplicateArchive(String),

    #[error("Refusing to restore into unsafe path: {0}")]
    UnsafeRestorePath(String),

    #[error("Required tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Ctrl+C at a prompt; ends the whole run
    #[error("Interrupted by operator")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn version_label(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "missing".to_string(),
    }
}

impl DrError {
    pub fn transfer(target: impl ToString, message: impl Into<String>) -> Self {
        DrError::TransferFailure {
            target: target.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DrError>;
