//! SSH transport to cluster nodes.
//!
//! `ssh2` is blocking, so every operation runs on the blocking pool. Streams
//! cross into the async gzip encoder/decoder through `SyncIoBridge`.

use crate::transfer::process::describe_exit;
use crate::transfer::RemoteCommand;
use crate::utils::{DrError, Result};
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::io::SyncIoBridge;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Login user on every node
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Private key; the SSH agent is used when unset
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Wrap node commands in `sudo -n`
    #[serde(default)]
    pub sudo: bool,

    /// Connect and handshake timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    15
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_port(),
            identity_file: None,
            sudo: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SshSettings {
    fn prepare(&self, command: &RemoteCommand) -> String {
        if self.sudo {
            command.clone().with_sudo().to_shell()
        } else {
            command.to_shell()
        }
    }

    fn connect(&self, host: &str) -> Result<ssh2::Session> {
        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        let addr = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| DrError::transfer(host, format!("cannot resolve host: {e}")))?
            .next()
            .ok_or_else(|| DrError::ResourceNotFound(format!("host {host} has no address")))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| DrError::transfer(host, format!("connect failed: {e}")))?;

        let mut sess = ssh2::Session::new().map_err(|e| ssh_error(host, e))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(timeout.as_millis() as u32);
        sess.handshake().map_err(|e| ssh_error(host, e))?;

        match &self.identity_file {
            Some(key) => sess.userauth_pubkey_file(&self.user, None, key, None),
            None => sess.userauth_agent(&self.user),
        }
        .map_err(|e| DrError::transfer(host, format!("SSH authentication failed: {e}")))?;

        if !sess.authenticated() {
            return Err(DrError::transfer(host, "SSH authentication failed"));
        }

        // Streams may go quiet for a long time (tar extraction, large dumps).
        sess.set_timeout(0);
        Ok(sess)
    }

    fn open(&self, host: &str, command: &RemoteCommand) -> Result<(ssh2::Session, ssh2::Channel)> {
        let sess = self.connect(host)?;
        let mut channel = sess.channel_session().map_err(|e| ssh_error(host, e))?;
        channel
            .exec(&self.prepare(command))
            .map_err(|e| ssh_error(host, e))?;
        Ok((sess, channel))
    }

    /// Run a command on `host` and return its stdout.
    pub async fn run_capture(&self, host: &str, command: &RemoteCommand) -> Result<Vec<u8>> {
        let settings = self.clone();
        let command = command.clone();
        let remote = host.to_string();

        join(host, tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let (_sess, mut channel) = settings.open(&remote, &command)?;
            let mut stdout = Vec::new();
            channel.read_to_end(&mut stdout)?;
            finish(&remote, channel)?;
            Ok(stdout)
        }))
        .await
    }

    /// Gzip the stdout of a command on `host` into `local`.
    pub async fn stream_to_file(
        &self,
        host: &str,
        command: &RemoteCommand,
        local: &Path,
    ) -> Result<u64> {
        let file = tokio::fs::File::create(local).await?;
        let mut sink = SyncIoBridge::new(GzipEncoder::new(file));
        let settings = self.clone();
        let command = command.clone();
        let remote = host.to_string();

        let result = join(host, tokio::task::spawn_blocking(move || -> Result<u64> {
            let (_sess, mut channel) = settings.open(&remote, &command)?;
            let copied = std::io::copy(&mut channel, &mut sink)
                .map_err(|e| DrError::transfer(&remote, format!("stream broken: {e}")))?;
            finish(&remote, channel)?;
            sink.shutdown()?;
            Ok(copied)
        }))
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(local).await;
        }
        result
    }

    /// Gunzip `local` into the stdin of a command on `host`.
    pub async fn stream_from_file(
        &self,
        local: &Path,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<()> {
        let file = match tokio::fs::File::open(local).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DrError::ArchiveMissing(local.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut source = SyncIoBridge::new(GzipDecoder::new(BufReader::new(file)));
        let settings = self.clone();
        let command = command.clone();
        let remote = host.to_string();

        join(host, tokio::task::spawn_blocking(move || -> Result<()> {
            let (_sess, mut channel) = settings.open(&remote, &command)?;
            let copied = std::io::copy(&mut source, &mut channel).and_then(|_| channel.flush());
            channel.send_eof().map_err(|e| ssh_error(&remote, e))?;

            let mut discard = Vec::new();
            let _ = channel.read_to_end(&mut discard);
            finish(&remote, channel)?;

            copied.map_err(|e| DrError::transfer(&remote, format!("stream broken: {e}")))?;
            Ok(())
        }))
        .await
    }
}

/// Collect stderr, wait for the channel to close and check the exit status.
fn finish(host: &str, mut channel: ssh2::Channel) -> Result<()> {
    let mut stderr = Vec::new();
    let _ = channel.stderr().read_to_end(&mut stderr);
    channel.wait_close().map_err(|e| ssh_error(host, e))?;
    let code = channel.exit_status().map_err(|e| ssh_error(host, e))?;
    if code != 0 {
        return Err(DrError::transfer(host, describe_exit(&code.to_string(), &stderr)));
    }
    Ok(())
}

async fn join<T>(host: &str, handle: tokio::task::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| DrError::transfer(host, format!("SSH task failed: {e}")))?
}

fn ssh_error(host: &str, e: ssh2::Error) -> DrError {
    DrError::transfer(host, format!("SSH error: {e}"))
}
