//! Backup collector: archives every declared resource into a fresh run
//! directory and writes the manifest.
//!
//! Items are collected one after another. A failing item is logged and
//! counted, and collection moves on; the manifest lists only the items that
//! produced a finished, non-empty archive.

pub mod runs;

use crate::cluster::{ClusterApi, Locator, Selector};
use crate::config::{host_target, relative_to_root, Config, DatabaseSpec, SqliteSpec, VolumeSpec};
use crate::manifest::{
    write_manifest, BackupRun, ClusterStateEntry, DatabaseEntry, Manifest, VolumeEntry,
};
use crate::report::{format_bytes, format_duration, RunResult};
use crate::transfer::{RemoteCommand, Target, Transport};
use crate::utils::{DrError, Result};
use async_compression::tokio::write::GzipEncoder;
use chrono::NaiveDateTime;
use runs::PruneReport;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Outcome of one backup run.
#[derive(Debug)]
pub struct BackupReport {
    pub run_dir: PathBuf,
    pub manifest: Manifest,
    pub result: RunResult,

    /// Present only when retention cleanup ran
    pub pruned: Option<PruneReport>,
}

/// One declared resource.
enum Item<'c> {
    ClusterState(&'c str),
    Database(&'c DatabaseSpec),
    Sqlite(&'c SqliteSpec),
    Volume(&'c VolumeSpec),
}

impl Item<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Item::ClusterState(_) => "k3s-state",
            Item::Database(_) => "database",
            Item::Sqlite(_) => "sqlite",
            Item::Volume(_) => "volume",
        }
    }

    fn id(&self) -> String {
        match self {
            Item::ClusterState(host) => format!("k3s-state@{host}"),
            Item::Database(db) => format!("{}/{}/{}", db.namespace, db.cluster, db.database),
            Item::Sqlite(s) => format!("{}/{}", s.namespace, s.pvc),
            Item::Volume(v) => format!("{}/{}", v.namespace, v.pvc),
        }
    }
}

enum Collected {
    ClusterState(ClusterStateEntry),
    Database(DatabaseEntry),
    Volume(VolumeEntry),
}

impl Collected {
    fn file(&self) -> &str {
        match self {
            Collected::ClusterState(e) => &e.file,
            Collected::Database(e) => &e.file,
            Collected::Volume(e) => &e.file,
        }
    }
}

pub struct BackupCollector<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
    locator: Locator<'a>,
}

impl<'a> BackupCollector<'a> {
    pub fn new(
        config: &'a Config,
        transport: &'a dyn Transport,
        cluster: &'a dyn ClusterApi,
    ) -> Self {
        Self {
            config,
            transport,
            locator: Locator::new(cluster, config.restore.strict_selectors),
        }
    }

    /// Run a backup stamped with the current local time.
    pub async fn run(&self) -> Result<BackupReport> {
        self.run_at(chrono::Local::now().naive_local()).await
    }

    /// Run a backup stamped with `started`.
    ///
    /// Only failing to create the run directory or to write the manifest is
    /// an error here; item failures end up in the report.
    pub async fn run_at(&self, started: NaiveDateTime) -> Result<BackupReport> {
        let clock = Instant::now();
        let (run_dir, timestamp) = runs::create_run_dir(&self.config.storage.base_dir, started)?;
        info!(run = %run_dir.display(), "Starting backup run");

        let mut run = BackupRun::new(timestamp.as_str());
        let mut result = RunResult::new();

        for item in self.items() {
            let id = item.id();
            info!(kind = item.kind(), item = %id, "Backing up");

            match self.collect(&item, &run_dir, &timestamp).await {
                Ok(collected) => {
                    let size = std::fs::metadata(run_dir.join(collected.file()))
                        .map(|m| m.len())
                        .unwrap_or(0);
                    info!(
                        kind = item.kind(),
                        item = %id,
                        file = collected.file(),
                        size = %format_bytes(size),
                        "Backed up"
                    );
                    result.record_success();
                    match collected {
                        Collected::ClusterState(entry) => {
                            if let Item::ClusterState(host) = &item {
                                run.control_plane = Some(host.to_string());
                            }
                            run.cluster_state = Some(entry);
                        }
                        Collected::Database(entry) => run.databases.push(entry),
                        Collected::Volume(entry) => run.volumes.push(entry),
                    }
                }
                Err(e) => {
                    error!(kind = item.kind(), item = %id, error = %e, "Backup failed");
                    result.record_failure(id);
                }
            }
        }

        let manifest: Manifest = run.into();
        write_manifest(&run_dir, &manifest)?;
        info!(entries = manifest.referenced_files().len(), "Manifest written");

        let pruned = if result.is_clean() {
            Some(runs::prune(
                &self.config.storage.base_dir,
                self.config.storage.retention_days,
                started,
                &run_dir,
            ))
        } else {
            warn!(failed = result.failed, "Skipping retention cleanup after a partial run");
            None
        };

        info!(
            %result,
            elapsed = %format_duration(clock.elapsed().as_secs()),
            "Backup run finished"
        );

        Ok(BackupReport {
            run_dir,
            manifest,
            result,
            pruned,
        })
    }

    /// Declared items in collection order: cluster state, databases, SQLite
    /// files, then whole volumes.
    fn items(&self) -> Vec<Item<'a>> {
        let config = self.config;
        let mut items = Vec::new();
        if let Some(host) = &config.control_plane.host {
            items.push(Item::ClusterState(host.as_str()));
        }
        items.extend(config.databases.iter().map(Item::Database));
        items.extend(config.sqlite.iter().map(Item::Sqlite));
        items.extend(config.volumes.iter().map(Item::Volume));
        items
    }

    async fn collect(&self, item: &Item<'_>, run_dir: &Path, timestamp: &str) -> Result<Collected> {
        match item {
            Item::ClusterState(host) => self.cluster_state(host, run_dir, timestamp).await,
            Item::Database(db) => self.database(db, run_dir, timestamp).await,
            Item::Sqlite(spec) => self.sqlite(spec, run_dir, timestamp).await,
            Item::Volume(spec) => self.volume(spec, run_dir, timestamp).await,
        }
    }

    /// Archive the control-plane state directly on its host.
    ///
    /// Optional paths missing on the host are left out; the required ones
    /// must all exist.
    async fn cluster_state(
        &self,
        host: &str,
        run_dir: &Path,
        timestamp: &str,
    ) -> Result<Collected> {
        let cp = &self.config.control_plane;
        let target = host_target(host);
        let file = format!("k3s-state-{timestamp}.tar.gz");
        let local = claim(run_dir, &file)?;

        let mut paths = cp.relative_paths();
        for optional in &cp.optional_paths {
            let probe = RemoteCommand::new("test").args(["-e", optional.as_str()]);
            match self.transport.run_capture(&target, &probe).await {
                Ok(_) => paths.push(relative_to_root(optional)),
                Err(_) => {
                    info!(%target, path = %optional, "Optional state path absent, skipping")
                }
            }
        }

        let command = RemoteCommand::new("tar")
            .args(["-C", "/", "-cf", "-"])
            .args(paths);
        self.archive(&target, &command, &local).await?;
        Ok(Collected::ClusterState(ClusterStateEntry { file }))
    }

    /// Dump one database from its cluster's primary and compress it locally.
    async fn database(
        &self,
        db: &DatabaseSpec,
        run_dir: &Path,
        timestamp: &str,
    ) -> Result<Collected> {
        let file = format!(
            "{}-{}-{}-{timestamp}.sql.gz",
            db.namespace, db.cluster, db.database
        );
        let local = claim(run_dir, &file)?;

        let target = self
            .locator
            .pod(&Selector::cnpg_primary(&db.namespace, &db.cluster))
            .await?;
        let command = RemoteCommand::new("pg_dump").args([
            "-U",
            db.user.as_str(),
            "-d",
            db.database.as_str(),
            "--clean",
            "--if-exists",
        ]);

        let dump = self.transport.run_capture(&target, &command).await?;
        if dump.is_empty() {
            return Err(DrError::transfer(&target, "dump produced no output"));
        }

        write_gzip(&local, &dump).await?;

        Ok(Collected::Database(DatabaseEntry {
            namespace: db.namespace.clone(),
            cluster: db.cluster.clone(),
            database: db.database.clone(),
            file,
        }))
    }

    /// Copy a SQLite database out of its owning pod.
    ///
    /// The online `.backup` gives a consistent copy; images without the
    /// `sqlite3` binary fall back to archiving the raw file.
    async fn sqlite(
        &self,
        spec: &SqliteSpec,
        run_dir: &Path,
        timestamp: &str,
    ) -> Result<Collected> {
        let file = format!("{}-{}-{timestamp}.tar.gz", spec.namespace, spec.pvc);
        let local = claim(run_dir, &file)?;
        let binding = self.locator.volume(&spec.namespace, &spec.pvc).await?;
        let target = self
            .locator
            .pod(&Selector::pod(
                spec.namespace.as_str(),
                spec.selector.as_str(),
                spec.container.clone(),
            ))
            .await?;

        let (subdir, db_name) = match spec.database.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, spec.database.as_str()),
        };
        let pod_dir = join_path(&spec.mount_path, subdir);
        let node_dir = join_path(&binding.path, subdir);

        let scratch = format!("/tmp/homelab-dr-{timestamp}");

        let online = self
            .transport
            .run_capture(
                &target,
                &RemoteCommand::new("mkdir").args(["-p", scratch.as_str()]),
            )
            .await;
        let online = match online {
            Ok(_) => {
                let backup = format!(".backup '{scratch}/{db_name}'");
                let command =
                    RemoteCommand::new("sqlite3").args([format!("{pod_dir}/{db_name}"), backup]);
                self.transport.run_capture(&target, &command).await
            }
            Err(e) => Err(e),
        };

        let archived = match online {
            Ok(_) => {
                let command =
                    RemoteCommand::new("tar").args(["-C", scratch.as_str(), "-cf", "-", db_name]);
                self.archive(&target, &command, &local).await
            }
            Err(e) => {
                warn!(
                    item = %spec.name,
                    error = %e,
                    "Online SQLite backup unavailable, copying the raw file"
                );
                let command =
                    RemoteCommand::new("tar").args(["-C", pod_dir.as_str(), "-cf", "-", db_name]);
                self.archive(&target, &command, &local).await
            }
        };

        let cleanup = RemoteCommand::new("rm").args(["-rf", scratch.as_str()]);
        if let Err(e) = self.transport.run_capture(&target, &cleanup).await {
            warn!(item = %spec.name, error = %e, "Could not remove scratch copy");
        }
        archived?;

        Ok(Collected::Volume(VolumeEntry {
            namespace: spec.namespace.clone(),
            pvc: spec.pvc.clone(),
            node: binding.node,
            path: node_dir,
            file,
            sqlite_file: Some(db_name.to_string()),
        }))
    }

    /// Archive a whole volume, through its pod when one is declared and on
    /// the backing node otherwise.
    async fn volume(
        &self,
        spec: &VolumeSpec,
        run_dir: &Path,
        timestamp: &str,
    ) -> Result<Collected> {
        let file = format!("{}-{}-{timestamp}.tar.gz", spec.namespace, spec.pvc);
        let local = claim(run_dir, &file)?;
        let binding = self.locator.volume(&spec.namespace, &spec.pvc).await?;

        let (target, dir) = match (&spec.selector, &spec.mount_path) {
            (Some(labels), Some(mount)) => {
                let selector = Selector::pod(
                    spec.namespace.as_str(),
                    labels.as_str(),
                    spec.container.clone(),
                );
                (self.locator.pod(&selector).await?, mount.clone())
            }
            _ => (host_target(&binding.node), binding.path.clone()),
        };

        let command = RemoteCommand::new("tar").args(["-C", dir.as_str(), "-cf", "-", "."]);
        self.archive(&target, &command, &local).await?;

        Ok(Collected::Volume(VolumeEntry {
            namespace: spec.namespace.clone(),
            pvc: spec.pvc.clone(),
            node: binding.node,
            path: binding.path,
            file,
            sqlite_file: None,
        }))
    }

    /// Stream a producer into `local`, treating empty output as a failure.
    async fn archive(&self, target: &Target, command: &RemoteCommand, local: &Path) -> Result<u64> {
        let bytes = self.transport.stream_to_file(target, command, local).await?;
        if bytes == 0 {
            let _ = tokio::fs::remove_file(local).await;
            return Err(DrError::transfer(target, format!("`{command}` produced no output")));
        }
        Ok(bytes)
    }
}

/// Path of a new archive in the run directory. Names are derived from
/// hyphen-joined identifiers, so two items can map to the same one; the
/// second is refused instead of overwriting the first.
fn claim(run_dir: &Path, file: &str) -> Result<PathBuf> {
    let path = run_dir.join(file);
    if path.try_exists()? {
        return Err(DrError::DuplicateArchive(file.to_string()));
    }
    Ok(path)
}

fn join_path(base: &str, sub: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match sub {
        Some(sub) if !sub.is_empty() => format!("{base}/{sub}"),
        _ => base.to_string(),
    }
}

/// Gzip `data` into `path`, removing the file if anything fails.
async fn write_gzip(path: &Path, data: &[u8]) -> Result<()> {
    async fn write(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let file = tokio::fs::File::create(path).await?;
        let mut encoder = GzipEncoder::new(file);
        encoder.write_all(data).await?;
        encoder.shutdown().await?;
        Ok(())
    }

    if let Err(e) = write(path, data).await {
        let _ = tokio::fs::remove_file(path).await;
        return Err(e.into());
    }
    Ok(())
}
