//! Configuration management for backup and restore runs.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! The file also carries the static list of resources the collector backs up.

use crate::cluster::KubectlSettings;
use crate::transfer::{SshSettings, Target};
use crate::utils::{DrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub kubectl: KubectlSettings,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub restore: RestoreConfig,

    #[serde(default)]
    pub databases: Vec<DatabaseSpec>,

    #[serde(default)]
    pub sqlite: Vec<SqliteSpec>,

    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per backup run
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Runs older than this many days are pruned after a clean run
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Control-plane node; no cluster-state capture when unset
    #[serde(default)]
    pub host: Option<String>,

    /// systemd unit stopped and started around a cluster-state restore
    #[serde(default = "default_service")]
    pub service: String,

    /// Absolute paths captured into the cluster-state archive
    #[serde(default = "default_state_paths")]
    pub paths: Vec<String>,

    /// Captured only when present on the host
    #[serde(default = "default_optional_paths")]
    pub optional_paths: Vec<String>,

    /// Where the pre-restore safety copy is written on the host
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Fail when a pod selector matches more than one pod
    #[serde(default)]
    pub strict_selectors: bool,

    /// Do not restore cluster state when the safety copy could not be taken
    #[serde(default)]
    pub strict_safety_snapshot: bool,
}

/// A database inside a CNPG cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub namespace: String,
    pub cluster: String,
    pub database: String,
    #[serde(default = "default_db_user")]
    pub user: String,
}

/// A SQLite database file living on a PVC, captured through its owning pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSpec {
    pub name: String,
    pub namespace: String,
    pub pvc: String,
    /// Label selector of the owning pod
    pub selector: String,
    /// Where the PVC is mounted inside the pod
    pub mount_path: String,
    /// Database file, relative to `mount_path`
    pub database: String,
    #[serde(default)]
    pub container: Option<String>,
}

/// A whole PVC, archived through its owning pod or, without a selector,
/// directly on the node that backs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub namespace: String,
    pub pvc: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub mount_path: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
}

// Default values
fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/backups/homelab")
}

fn default_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service() -> String {
    "k3s".to_string()
}

fn default_state_paths() -> Vec<String> {
    [
        "/var/lib/rancher/k3s/server/db",
        "/var/lib/rancher/k3s/server/token",
        "/var/lib/rancher/k3s/server/tls",
        "/var/lib/rancher/k3s/server/manifests",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_optional_paths() -> Vec<String> {
    vec!["/etc/rancher/k3s/config.yaml".to_string()]
}

fn default_snapshot_dir() -> String {
    "/var/lib/rancher/k3s-pre-restore".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            host: None,
            service: default_service(),
            paths: default_state_paths(),
            optional_paths: default_optional_paths(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

impl ControlPlaneConfig {
    /// Required paths relative to `/`, as they appear inside the state archive.
    pub fn relative_paths(&self) -> Vec<String> {
        self.paths.iter().map(|p| relative_to_root(p)).collect()
    }

    /// Required and optional paths relative to `/`.
    pub fn all_relative_paths(&self) -> Vec<String> {
        self.paths
            .iter()
            .chain(&self.optional_paths)
            .map(|p| relative_to_root(p))
            .collect()
    }
}

pub fn relative_to_root(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Transport target for a node name; the machine itself is reached locally.
pub fn host_target(host: &str) -> Target {
    if is_local_host(host) {
        Target::Local
    } else {
        Target::node(host)
    }
}

fn is_local_host(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .is_some_and(|h| h.eq_ignore_ascii_case(host))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// File (or defaults), then `.env` and process environment, then validation.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        let _ = dotenvy::dotenv();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BACKUP_BASE_DIR`, `BACKUP_RETENTION_DAYS` and `LOG_LEVEL`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("BACKUP_BASE_DIR").filter(|v| !v.is_empty()) {
            self.storage.base_dir = PathBuf::from(dir);
        }
        if let Some(days) = lookup("BACKUP_RETENTION_DAYS").filter(|v| !v.is_empty()) {
            self.storage.retention_days = days.trim().parse().map_err(|_| {
                DrError::Config(format!(
                    "BACKUP_RETENTION_DAYS must be a whole number of days, got {days:?}"
                ))
            })?;
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.retention_days == 0 {
            return Err(DrError::Config("retention_days must be at least 1".into()));
        }

        for path in &self.control_plane.paths {
            require_absolute("control_plane.paths", path)?;
        }
        for path in &self.control_plane.optional_paths {
            require_absolute("control_plane.optional_paths", path)?;
        }
        require_absolute("control_plane.snapshot_dir", &self.control_plane.snapshot_dir)?;

        let mut databases = HashSet::new();
        for db in &self.databases {
            if !databases.insert((&db.namespace, &db.cluster, &db.database)) {
                return Err(DrError::Config(format!(
                    "database {}/{}/{} is declared twice",
                    db.namespace, db.cluster, db.database
                )));
            }
        }

        let mut claims = HashSet::new();
        for item in &self.sqlite {
            require_absolute("sqlite.mount_path", &item.mount_path)?;
            if item.database.is_empty()
                || item.database.starts_with('/')
                || item.database.split('/').any(|c| c == "..")
            {
                return Err(DrError::Config(format!(
                    "sqlite {}: database must be a path inside mount_path, got {:?}",
                    item.name, item.database
                )));
            }
            // The name ends up inside a quoted sqlite3 dot-command.
            if item.database.contains(['\'', '"', '\\']) {
                return Err(DrError::Config(format!(
                    "sqlite {}: database name may not contain quotes or backslashes, got {:?}",
                    item.name, item.database
                )));
            }
            if !claims.insert((&item.namespace, &item.pvc)) {
                return Err(duplicate_claim(&item.namespace, &item.pvc));
            }
        }

        for vol in &self.volumes {
            match (&vol.selector, &vol.mount_path) {
                (Some(_), Some(mount)) => require_absolute("volumes.mount_path", mount)?,
                (Some(_), None) => {
                    return Err(DrError::Config(format!(
                        "volume {}/{}: a selector needs a mount_path",
                        vol.namespace, vol.pvc
                    )));
                }
                (None, _) => {}
            }
            if !claims.insert((&vol.namespace, &vol.pvc)) {
                return Err(duplicate_claim(&vol.namespace, &vol.pvc));
            }
        }

        Ok(())
    }
}

fn require_absolute(field: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') || path == "/" {
        return Err(DrError::Config(format!(
            "{field} must be an absolute path below /, got {path:?}"
        )));
    }
    Ok(())
}

fn duplicate_claim(namespace: &str, pvc: &str) -> DrError {
    DrError::Config(format!("pvc {namespace}/{pvc} is declared twice"))
}
