//! Child-process plumbing shared by the local and `kubectl exec` transports.

use crate::utils::{DrError, Result};
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Longest stderr tail carried into an error message.
const STDERR_TAIL: usize = 512;

/// Run a command to completion and return its stdout.
pub async fn capture(mut cmd: Command, target: &str) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    let output = cmd
        .output()
        .await
        .map_err(|e| DrError::transfer(target, format!("failed to start command: {e}")))?;

    if !output.status.success() {
        return Err(DrError::transfer(target, exit_message(output.status, &output.stderr)));
    }
    Ok(output.stdout)
}

/// Gzip a command's stdout into `local`. The file is removed on any failure.
pub async fn stream_to_gzip(cmd: Command, target: &str, local: &Path) -> Result<u64> {
    let result = produce_into(cmd, target, local).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(local).await;
    }
    result
}

async fn produce_into(mut cmd: Command, target: &str, local: &Path) -> Result<u64> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| DrError::transfer(target, format!("failed to start command: {e}")))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| DrError::transfer(target, "stdout was not captured"))?;
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let file = tokio::fs::File::create(local).await?;
    let mut encoder = GzipEncoder::new(file);

    let copied = match tokio::io::copy(&mut stdout, &mut encoder).await {
        Ok(n) => n,
        Err(e) => {
            let _ = child.kill().await;
            return Err(DrError::transfer(target, format!("stream broken: {e}")));
        }
    };

    let status = child.wait().await?;
    let stderr = stderr.await.unwrap_or_default();
    if !status.success() {
        return Err(DrError::transfer(target, exit_message(status, &stderr)));
    }

    encoder.shutdown().await?;
    Ok(copied)
}

/// Gunzip `local` into a command's stdin.
pub async fn stream_from_gzip(local: &Path, mut cmd: Command, target: &str) -> Result<()> {
    let file = match tokio::fs::File::open(local).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DrError::ArchiveMissing(local.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| DrError::transfer(target, format!("failed to start command: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| DrError::transfer(target, "stdin was not captured"))?;

    // Consumers such as psql are chatty; keep both pipes drained while feeding stdin.
    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let mut decoder = GzipDecoder::new(BufReader::new(file));
    let copied = tokio::io::copy(&mut decoder, &mut stdin).await;
    drop(stdin);

    let status = child.wait().await?;
    let _ = stdout.await;
    let stderr = stderr.await.unwrap_or_default();

    if !status.success() {
        return Err(DrError::transfer(target, exit_message(status, &stderr)));
    }
    if let Err(e) = copied {
        return Err(DrError::transfer(target, format!("stream broken: {e}")));
    }
    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

/// Describe a non-zero exit, with the tail of stderr when there is one.
pub fn exit_message(status: ExitStatus, stderr: &[u8]) -> String {
    let code = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    describe_exit(&code, stderr)
}

pub(crate) fn describe_exit(code: &str, stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return format!("exit status {code}");
    }
    let tail = match text.char_indices().rev().nth(STDERR_TAIL - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    };
    format!("exit status {code}: {tail}")
}
