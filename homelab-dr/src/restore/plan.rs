//! Restore planning: which manifest entries to restore, and in what order.

use crate::manifest::{ClusterStateEntry, DatabaseEntry, Manifest, VolumeEntry};
use std::fmt;
use std::path::{Path, PathBuf};

/// What a restore invocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    ClusterState,
    Databases,
    Volumes,
    All,
}

impl Scope {
    /// Menu order for interactive selection.
    pub const CHOICES: [Scope; 4] = [
        Scope::ClusterState,
        Scope::Databases,
        Scope::Volumes,
        Scope::All,
    ];

    fn includes(self, kind: ActionKind) -> bool {
        match self {
            Scope::All => true,
            Scope::ClusterState => kind == ActionKind::ClusterState,
            Scope::Databases => kind == ActionKind::Database,
            Scope::Volumes => kind == ActionKind::Volume,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::ClusterState => "k3s cluster state",
            Scope::Databases => "CNPG databases",
            Scope::Volumes => "PVC volumes",
            Scope::All => "everything",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    ClusterState,
    Database,
    Volume,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::ClusterState => "k3s-state",
            ActionKind::Database => "database",
            ActionKind::Volume => "volume",
        })
    }
}

/// One planned restore, carrying its manifest entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreAction {
    /// `host` is the control-plane node to restore on, if one is known
    ClusterState {
        entry: ClusterStateEntry,
        host: Option<String>,
    },
    Database(DatabaseEntry),
    Volume(VolumeEntry),
}

impl RestoreAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RestoreAction::ClusterState { .. } => ActionKind::ClusterState,
            RestoreAction::Database(_) => ActionKind::Database,
            RestoreAction::Volume(_) => ActionKind::Volume,
        }
    }

    pub fn id(&self) -> String {
        match self {
            RestoreAction::ClusterState { host: Some(host), .. } => format!("k3s-state@{host}"),
            RestoreAction::ClusterState { host: None, .. } => "k3s-state".to_string(),
            RestoreAction::Database(entry) => entry.id(),
            RestoreAction::Volume(entry) => entry.id(),
        }
    }

    /// Archive file name inside the run directory.
    pub fn file(&self) -> &str {
        match self {
            RestoreAction::ClusterState { entry, .. } => &entry.file,
            RestoreAction::Database(entry) => &entry.file,
            RestoreAction::Volume(entry) => &entry.file,
        }
    }

    /// What the action destroys, phrased for a confirmation prompt.
    pub fn describe(&self) -> String {
        match self {
            RestoreAction::ClusterState { host, .. } => format!(
                "Replace k3s state on {} (stops the service while restoring)",
                host.as_deref().unwrap_or("<unknown host>")
            ),
            RestoreAction::Database(entry) => format!(
                "Replay {} into database {} of cluster {}/{}",
                entry.file, entry.database, entry.namespace, entry.cluster
            ),
            RestoreAction::Volume(entry) => match &entry.sqlite_file {
                Some(db) => format!(
                    "Replace SQLite database {}/{db} of {} on {}",
                    entry.path,
                    entry.id(),
                    entry.node
                ),
                None => format!(
                    "Replace all contents of {} ({}) on {}",
                    entry.path,
                    entry.id(),
                    entry.node
                ),
            },
        }
    }
}

impl fmt::Display for RestoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} <- {}", self.kind(), self.id(), self.file())
    }
}

/// An ordered list of restore actions over one run directory.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub run_dir: PathBuf,
    pub scope: Scope,
    pub actions: Vec<RestoreAction>,
}

impl RestorePlan {
    /// Plan the restore of `manifest` for `scope`.
    ///
    /// Cluster state comes first, then databases, then volumes; entries of one
    /// kind keep their manifest order. The cluster-state host is the one
    /// recorded in the manifest, else `fallback_host`.
    pub fn build(
        manifest: &Manifest,
        run_dir: &Path,
        scope: Scope,
        fallback_host: Option<&str>,
    ) -> Self {
        let mut actions = Vec::new();

        if scope.includes(ActionKind::ClusterState) {
            if let Some(entry) = &manifest.k3s_state {
                actions.push(RestoreAction::ClusterState {
                    entry: entry.clone(),
                    host: manifest
                        .control_plane
                        .clone()
                        .or_else(|| fallback_host.map(String::from)),
                });
            }
        }
        if scope.includes(ActionKind::Database) {
            actions.extend(manifest.cnpg_databases.iter().cloned().map(RestoreAction::Database));
        }
        if scope.includes(ActionKind::Volume) {
            actions.extend(manifest.pvc_volumes.iter().cloned().map(RestoreAction::Volume));
        }

        Self {
            run_dir: run_dir.to_path_buf(),
            scope,
            actions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Database restores exec into pods through kubectl.
    pub fn needs_kubectl(&self) -> bool {
        self.actions.iter().any(|a| a.kind() == ActionKind::Database)
    }

    pub fn archive_path(&self, action: &RestoreAction) -> PathBuf {
        self.run_dir.join(action.file())
    }
}
