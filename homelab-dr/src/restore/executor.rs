//! Restore executor: walks a plan one action at a time.
//!
//! Each action moves through `Planned -> AwaitingConfirmation`, then either
//! to `Skipped` or through `[SafetySnapshotting ->] Restoring` to
//! `Succeeded` or `Failed`.
//! A failed action never stops the next one from being attempted; only an
//! operator interrupt at a prompt ends the run early.

use crate::cluster::{ClusterApi, Locator, Selector};
use crate::config::{host_target, Config};
use crate::manifest::{DatabaseEntry, VolumeEntry};
use crate::report::RunResult;
use crate::restore::plan::{ActionKind, RestoreAction, RestorePlan};
use crate::restore::prompt::Prompter;
use crate::transfer::{RemoteCommand, Target, Transport};
use crate::utils::{DrError, Result};
use std::fmt;
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionState {
    Planned,
    AwaitingConfirmation,
    Skipped,
    SafetySnapshotting,
    Restoring,
    Succeeded,
    Failed(String),
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Planned => f.write_str("planned"),
            ActionState::AwaitingConfirmation => f.write_str("awaiting confirmation"),
            ActionState::Skipped => f.write_str("skipped"),
            ActionState::SafetySnapshotting => f.write_str("safety snapshot"),
            ActionState::Restoring => f.write_str("restoring"),
            ActionState::Succeeded => f.write_str("succeeded"),
            ActionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The state history of one action.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub id: String,
    pub kind: ActionKind,
    pub transitions: Vec<ActionState>,
}

impl ActionRecord {
    fn new(action: &RestoreAction) -> Self {
        let record = Self {
            id: action.id(),
            kind: action.kind(),
            transitions: vec![ActionState::Planned],
        };
        info!(
            kind = %record.kind,
            item = %record.id,
            state = %ActionState::Planned,
            "Restore action"
        );
        record
    }

    pub fn state(&self) -> &ActionState {
        static PLANNED: ActionState = ActionState::Planned;
        self.transitions.last().unwrap_or(&PLANNED)
    }

    fn advance(&mut self, state: ActionState) {
        match &state {
            ActionState::Failed(_) => {
                error!(kind = %self.kind, item = %self.id, state = %state, "Restore action")
            }
            ActionState::Skipped => {
                warn!(kind = %self.kind, item = %self.id, state = %state, "Restore action")
            }
            _ => info!(kind = %self.kind, item = %self.id, state = %state, "Restore action"),
        }
        self.transitions.push(state);
    }

    fn fail(&mut self, error: &DrError) {
        self.advance(ActionState::Failed(error.to_string()));
    }
}

/// Per-action records plus the aggregated counts.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub result: RunResult,
    pub records: Vec<ActionRecord>,

    /// The operator pressed Ctrl+C at a prompt; later actions were not attempted
    pub interrupted: bool,
}

pub struct RestoreExecutor<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
    locator: Locator<'a>,
    prompter: &'a dyn Prompter,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(
        config: &'a Config,
        transport: &'a dyn Transport,
        cluster: &'a dyn ClusterApi,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            config,
            transport,
            locator: Locator::new(cluster, config.restore.strict_selectors),
            prompter,
        }
    }

    /// Attempt every action in plan order, stopping early only when the
    /// operator interrupts a prompt.
    pub async fn execute(&self, plan: &RestorePlan) -> RestoreOutcome {
        let mut result = RunResult::new();
        let mut records = Vec::with_capacity(plan.actions.len());
        let mut interrupted = false;

        for (i, action) in plan.actions.iter().enumerate() {
            let (record, stop) = self.run_action(plan, action).await;
            match record.state() {
                ActionState::Succeeded => result.record_success(),
                ActionState::Skipped => result.record_skip(),
                _ => result.record_failure(record.id.clone()),
            }
            records.push(record);

            if stop {
                warn!(
                    remaining = plan.actions.len() - i - 1,
                    "Restore interrupted, remaining actions not attempted"
                );
                interrupted = true;
                break;
            }
        }

        info!(%result, "Restore finished");
        RestoreOutcome {
            result,
            records,
            interrupted,
        }
    }

    /// Run one action; the flag is set when the operator interrupted it.
    async fn run_action(&self, plan: &RestorePlan, action: &RestoreAction) -> (ActionRecord, bool) {
        let mut record = ActionRecord::new(action);

        let archive = plan.archive_path(action);
        if !archive.is_file() {
            record.fail(&DrError::ArchiveMissing(archive));
            return (record, false);
        }

        record.advance(ActionState::AwaitingConfirmation);
        match self.prompter.confirm(&action.describe()) {
            Ok(true) => {}
            Ok(false) => {
                record.advance(ActionState::Skipped);
                return (record, false);
            }
            Err(e) => {
                let stop = matches!(e, DrError::Interrupted);
                record.fail(&e);
                return (record, stop);
            }
        }

        let restored = match action {
            RestoreAction::ClusterState { host, .. } => {
                self.restore_cluster_state(host.as_deref(), &archive, &mut record)
                    .await
            }
            RestoreAction::Database(entry) => {
                record.advance(ActionState::Restoring);
                self.restore_database(entry, &archive).await
            }
            RestoreAction::Volume(entry) => {
                record.advance(ActionState::Restoring);
                self.restore_volume(entry, &archive).await
            }
        };

        match restored {
            Ok(()) => record.advance(ActionState::Succeeded),
            Err(e) => record.fail(&e),
        }
        (record, false)
    }

    /// Stop the control plane, replace its files from the archive and start
    /// it again. The start is attempted even when the replacement failed.
    async fn restore_cluster_state(
        &self,
        host: Option<&str>,
        archive: &Path,
        record: &mut ActionRecord,
    ) -> Result<()> {
        let host = host.ok_or_else(|| {
            DrError::ResourceNotFound("control-plane host (not in manifest or config)".to_string())
        })?;
        let target = host_target(host);
        let cp = &self.config.control_plane;

        record.advance(ActionState::SafetySnapshotting);
        match self.safety_snapshot(&target).await {
            Ok(path) => info!(%target, snapshot = %path, "Safety snapshot written"),
            Err(e) if self.config.restore.strict_safety_snapshot => return Err(e),
            Err(e) => {
                warn!(
                    %target,
                    error = %e,
                    "Safety snapshot failed, restoring without a pre-restore copy"
                )
            }
        }

        record.advance(ActionState::Restoring);
        self.transport
            .run_capture(&target, &systemctl("stop", &cp.service))
            .await?;

        let replaced = self.replace_state(&target, archive).await;
        let started = self
            .transport
            .run_capture(&target, &systemctl("start", &cp.service))
            .await
            .map(|_| ());

        match (replaced, started) {
            (Err(e), Err(start)) => {
                error!(
                    %target,
                    error = %start,
                    "Control plane did not start after a failed restore"
                );
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn replace_state(&self, target: &Target, archive: &Path) -> Result<()> {
        let remove = RemoteCommand::new("rm")
            .arg("-rf")
            .args(self.config.control_plane.paths.iter().cloned());
        self.transport.run_capture(target, &remove).await?;

        let extract = RemoteCommand::new("tar").args(["-C", "/", "-xf", "-"]);
        self.transport.stream_from_file(archive, target, &extract).await
    }

    /// Copy the current state next to the live files on the host.
    async fn safety_snapshot(&self, target: &Target) -> Result<String> {
        let cp = &self.config.control_plane;
        let stamp = crate::collector::runs::format_timestamp(chrono::Local::now().naive_local());
        let path = format!(
            "{}/k3s-pre-restore-{stamp}.tar.gz",
            cp.snapshot_dir.trim_end_matches('/')
        );

        self.transport
            .run_capture(
                target,
                &RemoteCommand::new("mkdir").args(["-p", cp.snapshot_dir.as_str()]),
            )
            .await?;

        let snapshot = RemoteCommand::new("tar")
            .args(["--ignore-failed-read", "-C", "/", "-czf", path.as_str()])
            .args(cp.all_relative_paths());
        self.transport.run_capture(target, &snapshot).await?;
        Ok(path)
    }

    /// Replay a dump into the database on its cluster's current primary.
    async fn restore_database(&self, entry: &DatabaseEntry, archive: &Path) -> Result<()> {
        let user = self
            .config
            .databases
            .iter()
            .find(|d| {
                d.namespace == entry.namespace
                    && d.cluster == entry.cluster
                    && d.database == entry.database
            })
            .map(|d| d.user.as_str())
            .unwrap_or("postgres");

        let target = self
            .locator
            .pod(&Selector::cnpg_primary(&entry.namespace, &entry.cluster))
            .await?;

        let command = RemoteCommand::new("psql").args([
            "-U",
            user,
            "-d",
            entry.database.as_str(),
            "-v",
            "ON_ERROR_STOP=1",
        ]);
        self.transport.stream_from_file(archive, &target, &command).await
    }

    /// Clear the backing path on its node and extract the archive there.
    ///
    /// SQLite entries only replace the database file and its journal
    /// siblings; the rest of the directory is left alone.
    async fn restore_volume(&self, entry: &VolumeEntry, archive: &Path) -> Result<()> {
        let path = safe_restore_path(&entry.path)?;
        let target = host_target(&entry.node);

        self.transport
            .run_capture(&target, &RemoteCommand::new("mkdir").args(["-p", path]))
            .await?;

        let clear = match entry.sqlite_file.as_deref() {
            Some(db) => {
                if db.is_empty() || db.contains('/') || db == "." || db == ".." {
                    return Err(DrError::UnsafeRestorePath(format!("{path}/{db}")));
                }
                RemoteCommand::new("rm").arg("-f").args(
                    ["", "-wal", "-shm"]
                        .into_iter()
                        .map(|suffix| format!("{path}/{db}{suffix}")),
                )
            }
            None => RemoteCommand::new("find").args([path, "-mindepth", "1", "-delete"]),
        };
        self.transport.run_capture(&target, &clear).await?;

        let extract = RemoteCommand::new("tar").args(["-C", path, "-xf", "-"]);
        self.transport.stream_from_file(archive, &target, &extract).await
    }
}

fn systemctl(verb: &str, service: &str) -> RemoteCommand {
    RemoteCommand::new("systemctl").args([verb, service])
}

/// A volume path must be absolute, below `/` and free of `..`.
fn safe_restore_path(path: &str) -> Result<&str> {
    let trimmed = path.trim_end_matches('/');
    if !path.starts_with('/') || trimmed.is_empty() || trimmed.split('/').any(|c| c == "..") {
        return Err(DrError::UnsafeRestorePath(path.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::VolumeBinding;
    use crate::restore::plan::Scope;
    use crate::manifest::Manifest;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTransport {
        /// Commands whose shell form contains one of these fail
        fail_on: Vec<&'static str>,
        calls: Mutex<Vec<(Target, String)>>,
    }

    impl RecordingTransport {
        fn failing(fail_on: Vec<&'static str>) -> Self {
            Self {
                fail_on,
                ..Default::default()
            }
        }

        fn record(&self, target: &Target, command: &RemoteCommand) -> Result<()> {
            let line = command.to_shell();
            self.calls.lock().unwrap().push((target.clone(), line.clone()));
            if self.fail_on.iter().any(|needle| line.contains(needle)) {
                return Err(DrError::transfer(target, "exit status 1"));
            }
            Ok(())
        }

        fn lines(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn run_capture(&self, target: &Target, command: &RemoteCommand) -> Result<Vec<u8>> {
            self.record(target, command).map(|_| Vec::new())
        }

        async fn stream_to_file(
            &self,
            target: &Target,
            command: &RemoteCommand,
            _local: &Path,
        ) -> Result<u64> {
            self.record(target, command).map(|_| 0)
        }

        async fn stream_from_file(
            &self,
            local: &Path,
            target: &Target,
            command: &RemoteCommand,
        ) -> Result<()> {
            assert!(local.is_file());
            self.record(target, command)
        }
    }

    struct PrimaryOnly;

    #[async_trait]
    impl ClusterApi for PrimaryOnly {
        async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
            if selector.contains("instanceRole=primary") {
                Ok(vec![format!("{namespace}-postgres-1")])
            } else {
                Ok(Vec::new())
            }
        }

        async fn volume_binding(
            &self,
            _namespace: &str,
            _claim: &str,
        ) -> Result<Option<VolumeBinding>> {
            Ok(None)
        }
    }

    struct Answer(bool);

    /// Confirms the first action, then reports Ctrl+C.
    struct InterruptSecond(Mutex<usize>);

    impl Prompter for InterruptSecond {
        fn choose_scope(&self) -> Result<Option<Scope>> {
            Ok(Some(Scope::All))
        }

        fn confirm(&self, _question: &str) -> Result<bool> {
            let mut asked = self.0.lock().unwrap();
            *asked += 1;
            if *asked == 1 {
                Ok(true)
            } else {
                Err(DrError::Interrupted)
            }
        }
    }

    impl Prompter for Answer {
        fn choose_scope(&self) -> Result<Option<Scope>> {
            Ok(Some(Scope::All))
        }

        fn confirm(&self, _question: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn run_dir(manifest: &str) -> (TempDir, RestorePlan) {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::parse(manifest).unwrap();
        for file in manifest.referenced_files() {
            std::fs::write(dir.path().join(file), b"archive").unwrap();
        }
        let plan = RestorePlan::build(&manifest, dir.path(), Scope::All, None);
        (dir, plan)
    }

    const STATE: &str = r#"{ "version": 1, "control_plane": "k3s-server.invalid", "k3s_state": { "file": "k3s.tar.gz" } }"#;

    fn states(record: &ActionRecord) -> Vec<String> {
        record.transitions.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_cluster_state_sequence() {
        let (_dir, plan) = run_dir(STATE);
        let config = Config::default();
        let transport = RecordingTransport::default();
        let executor = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true));

        let outcome = executor.execute(&plan).await;
        assert_eq!(outcome.result.succeeded, 1);
        assert_eq!(
            states(&outcome.records[0]),
            ["planned", "awaiting confirmation", "safety snapshot", "restoring", "succeeded"]
        );

        let lines = transport.lines();
        assert_eq!(lines[0], "mkdir -p /var/lib/rancher/k3s-pre-restore");
        assert!(lines[1].starts_with(
            "tar --ignore-failed-read -C / -czf /var/lib/rancher/k3s-pre-restore/k3s-pre-restore-"
        ));
        assert!(lines[1].ends_with(" etc/rancher/k3s/config.yaml"));
        assert_eq!(lines[2], "systemctl stop k3s");
        assert!(lines[3].starts_with("rm -rf /var/lib/rancher/k3s/server/db "));
        assert_eq!(lines[4], "tar -C / -xf -");
        assert_eq!(lines[5], "systemctl start k3s");
        assert!(transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .all(|(t, _)| *t == Target::node("k3s-server.invalid")));
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_a_warning_unless_strict() {
        let (_dir, plan) = run_dir(STATE);
        let mut config = Config::default();

        let transport = RecordingTransport::failing(vec!["-czf"]);
        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert!(outcome.result.is_clean());
        assert!(transport.lines().contains(&"systemctl stop k3s".to_string()));

        config.restore.strict_safety_snapshot = true;
        let transport = RecordingTransport::failing(vec!["-czf"]);
        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!(outcome.result.failed, 1);
        assert!(!transport.lines().iter().any(|l| l.starts_with("systemctl")));
    }

    #[tokio::test]
    async fn test_service_restarted_after_failed_extraction() {
        let (_dir, plan) = run_dir(STATE);
        let config = Config::default();
        let transport = RecordingTransport::failing(vec!["-xf"]);

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!(outcome.result.failed, 1);
        assert_eq!(transport.lines().last().unwrap(), "systemctl start k3s");
    }

    #[tokio::test]
    async fn test_declined_action_touches_nothing() {
        let (_dir, plan) = run_dir(STATE);
        let config = Config::default();
        let transport = RecordingTransport::default();

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(false))
            .execute(&plan)
            .await;
        assert_eq!((outcome.result.skipped, outcome.result.failed), (1, 0));
        assert_eq!(outcome.result.exit_code(), 0);
        assert_eq!(outcome.records[0].state(), &ActionState::Skipped);
        assert!(transport.lines().is_empty());
    }

    #[tokio::test]
    async fn test_missing_archive_fails_without_touching_target() {
        let (dir, plan) = run_dir(STATE);
        std::fs::remove_file(dir.path().join("k3s.tar.gz")).unwrap();
        let config = Config::default();
        let transport = RecordingTransport::default();

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!(outcome.result.failed, 1);
        assert!(matches!(
            outcome.records[0].state(),
            ActionState::Failed(m) if m.contains("k3s.tar.gz")
        ));
        assert!(transport.lines().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_actions() {
        let (_dir, plan) = run_dir(
            r#"{ "version": 1,
                 "cnpg_databases": [
                    { "namespace": "mealie", "cluster": "mealie-postgres", "database": "mealie", "file": "m.sql.gz" },
                    { "namespace": "immich", "cluster": "immich-postgres", "database": "immich", "file": "i.sql.gz" }
                 ],
                 "pvc_volumes": [
                    { "namespace": "vw", "pvc": "data", "node": "node-1", "path": "/srv/vw/", "file": "vw.tar.gz", "sqlite_file": "db.sqlite3" }
                 ] }"#,
        );
        let config = Config::default();
        let transport = RecordingTransport::failing(vec!["-d mealie"]);

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!((outcome.result.succeeded, outcome.result.failed), (2, 1));
        assert_eq!(outcome.result.failed_items, ["mealie/mealie-postgres/mealie"]);

        let lines = transport.lines();
        assert_eq!(lines[1], "psql -U postgres -d immich -v ON_ERROR_STOP=1");
        assert_eq!(lines[2], "mkdir -p /srv/vw");
        assert_eq!(
            lines[3],
            "rm -f /srv/vw/db.sqlite3 /srv/vw/db.sqlite3-wal /srv/vw/db.sqlite3-shm"
        );
        assert_eq!(lines[4], "tar -C /srv/vw -xf -");
    }

    #[tokio::test]
    async fn test_interrupt_at_prompt_ends_the_run() {
        let (_dir, plan) = run_dir(
            r#"{ "version": 1,
                 "cnpg_databases": [
                    { "namespace": "mealie", "cluster": "mealie-postgres", "database": "mealie", "file": "m.sql.gz" },
                    { "namespace": "immich", "cluster": "immich-postgres", "database": "immich", "file": "i.sql.gz" }
                 ],
                 "pvc_volumes": [
                    { "namespace": "paperless", "pvc": "data", "node": "node-2", "path": "/srv/paperless", "file": "p.tar.gz" }
                 ] }"#,
        );
        let config = Config::default();
        let transport = RecordingTransport::default();
        let prompter = InterruptSecond(Mutex::new(0));

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &prompter)
            .execute(&plan)
            .await;
        assert!(outcome.interrupted);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!((outcome.result.succeeded, outcome.result.failed), (1, 1));
        assert_eq!(outcome.result.failed_items, ["immich/immich-postgres/immich"]);
        assert_eq!(*prompter.0.lock().unwrap(), 2);
        assert_eq!(transport.lines(), ["psql -U postgres -d mealie -v ON_ERROR_STOP=1"]);
    }

    #[tokio::test]
    async fn test_unsafe_volume_path_is_refused() {
        let (_dir, plan) = run_dir(
            r#"{ "version": 1, "pvc_volumes": [
                { "namespace": "a", "pvc": "b", "node": "node-1", "path": "/", "file": "b.tar.gz" }
            ] }"#,
        );
        let config = Config::default();
        let transport = RecordingTransport::default();

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!(outcome.result.failed, 1);
        assert!(transport.lines().is_empty());
    }

    #[tokio::test]
    async fn test_directory_volume_is_cleared_then_extracted() {
        let (_dir, plan) = run_dir(
            r#"{ "version": 1, "pvc_volumes": [
                { "namespace": "paperless", "pvc": "data", "node": "node-2", "path": "/var/lib/rancher/k3s/storage/pvc-1", "file": "p.tar.gz" }
            ] }"#,
        );
        let config = Config::default();
        let transport = RecordingTransport::default();

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert!(outcome.result.is_clean());
        assert_eq!(
            transport.lines(),
            [
                "mkdir -p /var/lib/rancher/k3s/storage/pvc-1",
                "find /var/lib/rancher/k3s/storage/pvc-1 -mindepth 1 -delete",
                "tar -C /var/lib/rancher/k3s/storage/pvc-1 -xf -",
            ]
        );
    }

    #[tokio::test]
    async fn test_no_control_plane_host_fails() {
        let (_dir, plan) = run_dir(r#"{ "version": 1, "k3s_state": { "file": "k3s.tar.gz" } }"#);
        let config = Config::default();
        let transport = RecordingTransport::default();

        let outcome = RestoreExecutor::new(&config, &transport, &PrimaryOnly, &Answer(true))
            .execute(&plan)
            .await;
        assert_eq!(outcome.result.failed, 1);
        assert!(transport.lines().is_empty());
    }

    #[test]
    fn test_safe_restore_path() {
        assert_eq!(safe_restore_path("/srv/data/").unwrap(), "/srv/data");
        for bad in ["/", "//", "relative/dir", "/srv/../etc", ""] {
            assert!(matches!(safe_restore_path(bad), Err(DrError::UnsafeRestorePath(_))), "{bad}");
        }
    }
}
