//! The production [`Transport`]: `kubectl exec` for pods, SSH for nodes and
//! plain child processes for the local machine.

use crate::cluster::KubectlSettings;
use crate::transfer::{process, RemoteCommand, SshSettings, Target, Transport};
use crate::utils::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

pub struct ClusterTransport {
    kubectl: KubectlSettings,
    ssh: SshSettings,
}

impl ClusterTransport {
    pub fn new(kubectl: KubectlSettings, ssh: SshSettings) -> Self {
        Self { kubectl, ssh }
    }

    /// Build the local process that runs `command` on a pod or locally.
    /// Node targets never get here.
    fn local_command(&self, target: &Target, command: &RemoteCommand, stdin: bool) -> Command {
        match target {
            Target::Pod {
                namespace,
                pod,
                container,
            } => {
                let mut cmd = self.kubectl.command();
                cmd.arg("exec");
                if stdin {
                    cmd.arg("-i");
                }
                cmd.args(["-n", namespace.as_str(), pod.as_str()]);
                if let Some(container) = container {
                    cmd.args(["-c", container.as_str()]);
                }
                cmd.arg("--").args(command.argv());
                cmd
            }
            Target::Node { .. } | Target::Local => {
                let mut cmd = Command::new(command.program());
                cmd.args(&command.argv()[1..]);
                cmd
            }
        }
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    async fn run_capture(&self, target: &Target, command: &RemoteCommand) -> Result<Vec<u8>> {
        tracing::debug!(%target, %command, "run");
        match target {
            Target::Node { host } => self.ssh.run_capture(host, command).await,
            _ => {
                let child = self.local_command(target, command, false);
                process::capture(child, &target.to_string()).await
            }
        }
    }

    async fn stream_to_file(
        &self,
        target: &Target,
        command: &RemoteCommand,
        local: &Path,
    ) -> Result<u64> {
        tracing::debug!(%target, %command, file = %local.display(), "stream to file");
        match target {
            Target::Node { host } => self.ssh.stream_to_file(host, command, local).await,
            _ => {
                let cmd = self.local_command(target, command, false);
                process::stream_to_gzip(cmd, &target.to_string(), local).await
            }
        }
    }

    async fn stream_from_file(
        &self,
        local: &Path,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<()> {
        tracing::debug!(%target, %command, file = %local.display(), "stream from file");
        match target {
            Target::Node { host } => self.ssh.stream_from_file(local, host, command).await,
            _ => {
                let cmd = self.local_command(target, command, true);
                process::stream_from_gzip(local, cmd, &target.to_string()).await
            }
        }
    }
}
