//! End-to-end backup and restore against an in-memory cluster.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use homelab_dr::cluster::{ClusterApi, VolumeBinding};
use homelab_dr::collector::{runs, BackupCollector};
use homelab_dr::config::{Config, DatabaseSpec, SqliteSpec, VolumeSpec};
use homelab_dr::manifest::{read_manifest, MANIFEST_FILE};
use homelab_dr::restore::{ActionState, Prompter, RestoreExecutor, RestorePlan, Scope};
use homelab_dr::transfer::{RemoteCommand, Target, Transport};
use homelab_dr::{DrError, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

/// Pods and volumes exist for everything except the `ghost` cluster and
/// claims named `unbound`.
struct FakeCluster;

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        if selector.contains("cluster=ghost") {
            return Ok(Vec::new());
        }
        Ok(vec![format!("{namespace}-0")])
    }

    async fn volume_binding(&self, namespace: &str, claim: &str) -> Result<Option<VolumeBinding>> {
        if claim == "unbound" {
            return Ok(None);
        }
        Ok(Some(VolumeBinding {
            node: "node-1".to_string(),
            path: format!("/var/lib/rancher/k3s/storage/{namespace}-{claim}"),
        }))
    }
}

/// Produces a payload naming the command that produced it, and records
/// everything streamed back in.
#[derive(Default)]
struct FakeTransport {
    commands: Mutex<Vec<String>>,
    received: Mutex<Vec<(Target, String, Vec<u8>)>>,
}

impl FakeTransport {
    fn log(&self, target: &Target, command: &RemoteCommand) {
        self.commands
            .lock()
            .unwrap()
            .push(format!("{target}: {command}"));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run_capture(&self, target: &Target, command: &RemoteCommand) -> Result<Vec<u8>> {
        self.log(target, command);
        match command.program() {
            "pg_dump" => Ok(format!("-- dump from {target}\n").into_bytes()),
            _ => Ok(Vec::new()),
        }
    }

    async fn stream_to_file(
        &self,
        target: &Target,
        command: &RemoteCommand,
        local: &Path,
    ) -> Result<u64> {
        self.log(target, command);
        let payload = format!("archive of `{command}` on {target}");
        write_gzip(local, payload.as_bytes()).await;
        Ok(payload.len() as u64)
    }

    async fn stream_from_file(
        &self,
        local: &Path,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<()> {
        self.log(target, command);
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|_| DrError::ArchiveMissing(local.to_path_buf()))?;
        let mut data = Vec::new();
        GzipDecoder::new(BufReader::new(file))
            .read_to_end(&mut data)
            .await?;
        self.received
            .lock()
            .unwrap()
            .push((target.clone(), command.to_shell(), data));
        Ok(())
    }
}

/// Answers confirmations from a script; an exhausted script declines.
struct Scripted(Mutex<VecDeque<bool>>);

impl Scripted {
    fn new(answers: &[bool]) -> Self {
        Self(Mutex::new(answers.iter().copied().collect()))
    }
}

impl Prompter for Scripted {
    fn choose_scope(&self) -> Result<Option<Scope>> {
        Ok(None)
    }

    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(self.0.lock().unwrap().pop_front().unwrap_or(false))
    }
}

async fn write_gzip(path: &Path, data: &[u8]) {
    let file = tokio::fs::File::create(path).await.unwrap();
    let mut encoder = GzipEncoder::new(file);
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
}

/// Five items, two of which cannot be found in the cluster.
fn five_item_config(base: &Path) -> Config {
    let mut config = Config::default();
    config.storage.base_dir = base.to_path_buf();
    config.databases = vec![
        DatabaseSpec {
            namespace: "mealie".to_string(),
            cluster: "mealie-postgres".to_string(),
            database: "mealie".to_string(),
            user: "postgres".to_string(),
        },
        DatabaseSpec {
            namespace: "old".to_string(),
            cluster: "ghost".to_string(),
            database: "ghost".to_string(),
            user: "postgres".to_string(),
        },
    ];
    config.sqlite = vec![SqliteSpec {
        name: "vaultwarden".to_string(),
        namespace: "vaultwarden".to_string(),
        pvc: "data".to_string(),
        selector: "app=vaultwarden".to_string(),
        mount_path: "/data".to_string(),
        database: "db.sqlite3".to_string(),
        container: None,
    }];
    config.volumes = vec![
        VolumeSpec {
            namespace: "paperless".to_string(),
            pvc: "media".to_string(),
            selector: Some("app=paperless".to_string()),
            mount_path: Some("/usr/src/paperless/media".to_string()),
            container: None,
        },
        VolumeSpec {
            namespace: "jellyfin".to_string(),
            pvc: "unbound".to_string(),
            selector: None,
            mount_path: None,
            container: None,
        },
    ];
    config.validate().unwrap();
    config
}

fn started() -> chrono::NaiveDateTime {
    runs::parse_timestamp("20260101-020000").unwrap()
}

#[tokio::test]
async fn partial_backup_lists_only_successful_items() {
    let base = TempDir::new().unwrap();
    let config = five_item_config(base.path());
    let transport = FakeTransport::default();

    let report = BackupCollector::new(&config, &transport, &FakeCluster)
        .run_at(started())
        .await
        .unwrap();

    assert_eq!(report.result.succeeded, 3);
    assert_eq!(report.result.failed, 2);
    assert_eq!(report.result.exit_code(), 1);
    assert_eq!(
        report.result.failed_items,
        ["old/ghost/ghost", "jellyfin/unbound"]
    );
    assert!(report.result.to_string().starts_with("3 succeeded, 2 failed"));
    assert!(report.pruned.is_none());

    let manifest = read_manifest(&report.run_dir).unwrap();
    assert_eq!(manifest, report.manifest);
    assert_eq!(manifest.cnpg_databases.len(), 1);
    assert_eq!(manifest.pvc_volumes.len(), 2);
    assert_eq!(manifest.referenced_files().len(), 3);
    for file in manifest.referenced_files() {
        let len = std::fs::metadata(report.run_dir.join(file)).unwrap().len();
        assert!(len > 0, "{file} is empty");
    }

    let names: Vec<String> = std::fs::read_dir(&report.run_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names.len(), 4);
    assert!(names.contains(&MANIFEST_FILE.to_string()));
}

#[tokio::test]
async fn back_to_back_backups_do_not_share_files() {
    let base = TempDir::new().unwrap();
    let config = five_item_config(base.path());
    let transport = FakeTransport::default();
    let collector = BackupCollector::new(&config, &transport, &FakeCluster);

    let first = collector.run_at(started()).await.unwrap();
    let first_files: Vec<(String, Vec<u8>)> = first
        .manifest
        .referenced_files()
        .into_iter()
        .map(|f| (f.to_string(), std::fs::read(first.run_dir.join(f)).unwrap()))
        .collect();

    let second = collector.run_at(started()).await.unwrap();

    assert_ne!(first.run_dir, second.run_dir);
    assert_ne!(first.manifest.timestamp, second.manifest.timestamp);
    for file in second.manifest.referenced_files() {
        assert!(!first.manifest.referenced_files().contains(&file));
    }
    for (name, content) in first_files {
        assert_eq!(std::fs::read(first.run_dir.join(&name)).unwrap(), content);
    }
}

#[tokio::test]
async fn database_restore_streams_dump_into_psql() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(MANIFEST_FILE),
        r#"{
            "version": 1,
            "timestamp": "20260101-000000",
            "cnpg_databases": [
                { "namespace": "mealie", "cluster": "mealie-postgres", "database": "mealie", "file": "mealie-postgres-20260101.sql.gz" }
            ]
        }"#,
    )
    .unwrap();
    write_gzip(
        &dir.path().join("mealie-postgres-20260101.sql.gz"),
        b"CREATE TABLE recipes ();\n",
    )
    .await;

    let manifest = read_manifest(dir.path()).unwrap();
    let plan = RestorePlan::build(&manifest, dir.path(), Scope::Databases, None);
    let config = Config::default();
    let transport = FakeTransport::default();
    let prompter = Scripted::new(&[true]);

    let outcome = RestoreExecutor::new(&config, &transport, &FakeCluster, &prompter)
        .execute(&plan)
        .await;

    assert_eq!(outcome.result.exit_code(), 0);
    assert_eq!(outcome.result.succeeded, 1);
    assert_eq!(outcome.records.len(), 1);

    let transitions = &outcome.records[0].transitions;
    let restoring_then_succeeded = transitions
        .windows(2)
        .filter(|w| w[0] == ActionState::Restoring && w[1] == ActionState::Succeeded)
        .count();
    assert_eq!(restoring_then_succeeded, 1);

    let received = transport.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (target, command, data) = &received[0];
    assert_eq!(
        *target,
        Target::pod("mealie", "mealie-0", Some("postgres".to_string()))
    );
    assert_eq!(command, "psql -U postgres -d mealie -v ON_ERROR_STOP=1");
    assert_eq!(data, b"CREATE TABLE recipes ();\n");
}

#[tokio::test]
async fn cluster_state_scope_without_entry_does_nothing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(MANIFEST_FILE),
        r#"{ "version": 1, "cnpg_databases": [
            { "namespace": "mealie", "cluster": "mealie-postgres", "database": "mealie", "file": "m.sql.gz" }
        ] }"#,
    )
    .unwrap();

    let manifest = read_manifest(dir.path()).unwrap();
    let plan = RestorePlan::build(&manifest, dir.path(), Scope::ClusterState, Some("k3s-server"));
    assert!(plan.is_empty());

    let config = Config::default();
    let transport = FakeTransport::default();
    let prompter = Scripted::new(&[true]);
    let outcome = RestoreExecutor::new(&config, &transport, &FakeCluster, &prompter)
        .execute(&plan)
        .await;

    assert_eq!(outcome.result.exit_code(), 0);
    assert!(outcome.records.is_empty());
    assert!(transport.commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn full_round_trip_with_one_declined_volume() {
    let base = TempDir::new().unwrap();
    let config = five_item_config(base.path());
    let transport = FakeTransport::default();

    let backup = BackupCollector::new(&config, &transport, &FakeCluster)
        .run_at(started())
        .await
        .unwrap();
    transport.commands.lock().unwrap().clear();

    let manifest = read_manifest(&backup.run_dir).unwrap();
    let plan = RestorePlan::build(&manifest, &backup.run_dir, Scope::All, None);
    assert_eq!(plan.actions.len(), 3);

    // Confirm the database and the SQLite file, decline the paperless volume.
    let prompter = Scripted::new(&[true, true, false]);
    let outcome = RestoreExecutor::new(&config, &transport, &FakeCluster, &prompter)
        .execute(&plan)
        .await;

    assert_eq!(
        (outcome.result.succeeded, outcome.result.failed, outcome.result.skipped),
        (2, 0, 1)
    );
    assert_eq!(outcome.result.exit_code(), 0);
    assert_eq!(outcome.records[2].state(), &ActionState::Skipped);

    let commands = transport.commands.lock().unwrap();
    assert!(!commands.iter().any(|c| c.contains("paperless")));
    assert!(commands
        .iter()
        .any(|c| c == "node node-1: rm -f /var/lib/rancher/k3s/storage/vaultwarden-data/db.sqlite3 /var/lib/rancher/k3s/storage/vaultwarden-data/db.sqlite3-wal /var/lib/rancher/k3s/storage/vaultwarden-data/db.sqlite3-shm"));

    let received = transport.received.lock().unwrap();
    assert_eq!(received[0].2, b"-- dump from pod mealie/mealie-0 (postgres)\n");
}

#[tokio::test]
async fn unsupported_manifest_version_is_refused() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(MANIFEST_FILE),
        r#"{ "version": 2, "cnpg_databases": [] }"#,
    )
    .unwrap();

    match read_manifest(dir.path()) {
        Err(DrError::UnsupportedManifestVersion(Some(2))) => {}
        other => panic!("expected a version error, got {other:?}"),
    }
}
