//! Remote command execution and byte-stream transfer.
//!
//! Backup and restore both talk to the cluster through the [`Transport`]
//! trait: capture a command's stdout, stream a producer's stdout into a local
//! gzip file, or stream a local gzip file into a consumer's stdin. Commands
//! are argv vectors; they are only rendered to a shell string for SSH, and
//! then every word is quoted.

pub mod cluster;
pub mod process;
pub mod ssh;

use crate::utils::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

pub use cluster::ClusterTransport;
pub use ssh::SshSettings;

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A container in a running pod, reached through `kubectl exec`
    Pod {
        namespace: String,
        pod: String,
        container: Option<String>,
    },

    /// A cluster node, reached over SSH
    Node { host: String },

    /// The machine this process runs on
    Local,
}

impl Target {
    pub fn pod(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: Option<String>,
    ) -> Self {
        Target::Pod {
            namespace: namespace.into(),
            pod: pod.into(),
            container,
        }
    }

    pub fn node(host: impl Into<String>) -> Self {
        Target::Node { host: host.into() }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pod {
                namespace,
                pod,
                container: Some(c),
            } => write!(f, "pod {namespace}/{pod} ({c})"),
            Target::Pod {
                namespace,
                pod,
                container: None,
            } => write!(f, "pod {namespace}/{pod}"),
            Target::Node { host } => write!(f, "node {host}"),
            Target::Local => write!(f, "localhost"),
        }
    }
}

/// A command as an argv vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    argv: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Prefix with `sudo -n` (non-interactive; fails instead of prompting).
    pub fn with_sudo(self) -> Self {
        RemoteCommand::new("sudo").arg("-n").args(self.argv)
    }

    /// Render for a POSIX shell, quoting every word.
    pub fn to_shell(&self) -> String {
        self.argv
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Quote one word for a POSIX shell.
///
/// Words made only of safe characters pass through unchanged; anything else is
/// wrapped in single quotes, with embedded single quotes written as `'\''`.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Remote execution and streaming, independent of how a target is reached.
///
/// Every operation fails with `TransferFailure` on a non-zero exit status or
/// a broken stream. The streaming operations never leave a partial local file
/// behind on failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on `target` and return its stdout.
    async fn run_capture(&self, target: &Target, command: &RemoteCommand) -> Result<Vec<u8>>;

    /// Run a producer on `target` and gzip its stdout into `local`.
    /// Returns the number of uncompressed bytes received.
    async fn stream_to_file(
        &self,
        target: &Target,
        command: &RemoteCommand,
        local: &Path,
    ) -> Result<u64>;

    /// Gunzip `local` into the stdin of a consumer running on `target`.
    async fn stream_from_file(
        &self,
        local: &Path,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<()>;
}
