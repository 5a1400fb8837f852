//! Backup manifest: the description of one run directory.
//!
//! A manifest is written once at the end of a backup run, next to the archives
//! it references, and read by every later restore. Readers check `version`
//! before anything else and refuse unknown versions. Apart from that the
//! schema is additive: absent arrays mean "no entries of that kind".

use crate::utils::{DrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Manifest file name inside a run directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// The only schema version this build understands.
pub const SCHEMA_VERSION: u64 = 1;

/// Backup manifest, serialized as `manifest.json` in each run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,

    #[serde(default)]
    pub timestamp: String,

    /// Host whose control-plane state was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_state: Option<ClusterStateEntry>,

    #[serde(default)]
    pub cnpg_databases: Vec<DatabaseEntry>,

    #[serde(default)]
    pub pvc_volumes: Vec<VolumeEntry>,
}

/// Control-plane datastore, token, TLS material, manifests and service config
/// bundled as one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateEntry {
    pub file: String,
}

/// One logical dump of a database inside a CNPG cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub namespace: String,
    pub cluster: String,
    pub database: String,
    pub file: String,
}

/// One archived persistent volume (or a single SQLite file inside one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub namespace: String,
    pub pvc: String,
    pub node: String,
    /// Absolute backing path on `node`
    pub path: String,
    pub file: String,

    /// Set when the archive holds a single SQLite database file living in `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_file: Option<String>,
}

impl DatabaseEntry {
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.cluster, self.database)
    }
}

impl VolumeEntry {
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.pvc)
    }
}

/// One timestamped snapshot, accumulated by the collector as items succeed.
#[derive(Debug, Clone, Default)]
pub struct BackupRun {
    pub timestamp: String,
    pub control_plane: Option<String>,
    pub cluster_state: Option<ClusterStateEntry>,
    pub databases: Vec<DatabaseEntry>,
    pub volumes: Vec<VolumeEntry>,
}

impl BackupRun {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            ..Default::default()
        }
    }
}

impl From<BackupRun> for Manifest {
    fn from(run: BackupRun) -> Self {
        Manifest {
            version: SCHEMA_VERSION,
            timestamp: run.timestamp,
            control_plane: run.cluster_state.as_ref().and(run.control_plane),
            k3s_state: run.cluster_state,
            cnpg_databases: run.databases,
            pvc_volumes: run.volumes,
        }
    }
}

impl Manifest {
    /// Every archive file name the manifest references, in manifest order.
    pub fn referenced_files(&self) -> Vec<&str> {
        let mut files = Vec::new();
        if let Some(state) = &self.k3s_state {
            files.push(state.file.as_str());
        }
        files.extend(self.cnpg_databases.iter().map(|d| d.file.as_str()));
        files.extend(self.pvc_volumes.iter().map(|v| v.file.as_str()));
        files
    }

    pub fn is_empty(&self) -> bool {
        self.k3s_state.is_none() && self.cnpg_databases.is_empty() && self.pvc_volumes.is_empty()
    }

    /// Parse and validate manifest JSON.
    ///
    /// The version is checked on the raw document first, so a manifest from a
    /// newer schema is rejected even if the rest of it would not parse.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| DrError::InvalidManifest(e.to_string()))?;

        let version = raw.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(SCHEMA_VERSION) {
            return Err(DrError::UnsupportedManifestVersion(version));
        }

        let manifest: Manifest =
            serde_json::from_value(raw).map_err(|e| DrError::InvalidManifest(e.to_string()))?;

        for file in manifest.referenced_files() {
            if !is_plain_file_name(file) {
                return Err(DrError::InvalidManifest(format!(
                    "archive name must be a plain file name: {file:?}"
                )));
            }
        }

        Ok(manifest)
    }
}

/// Archives live flat in the run directory, so names never contain separators.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

/// Read the manifest of a run directory.
pub fn read_manifest(run_dir: &Path) -> Result<Manifest> {
    let path = run_dir.join(MANIFEST_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DrError::ManifestMissing(path));
        }
        Err(e) => return Err(e.into()),
    };
    Manifest::parse(&content)
}

/// Write the manifest of a run directory.
///
/// Every referenced archive must already be finalized in `run_dir`,
/// non-empty and referenced by exactly one entry. The file is written to a
/// temporary name and renamed into place so a reader never observes a
/// half-written manifest.
pub fn write_manifest(run_dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let mut seen = HashSet::new();
    for file in manifest.referenced_files() {
        if !seen.insert(file) {
            return Err(DrError::InvalidManifest(format!(
                "archive referenced by more than one entry: {file}"
            )));
        }
        let archive = run_dir.join(file);
        let len = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            return Err(DrError::InvalidManifest(format!(
                "referenced archive is missing or empty: {}",
                archive.display()
            )));
        }
    }

    let path = run_dir.join(MANIFEST_FILE);
    let tmp = run_dir.join(format!("{MANIFEST_FILE}.tmp"));
    std::fs::write(&tmp, serde_json::to_string_pretty(manifest)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}
