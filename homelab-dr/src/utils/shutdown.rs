//! SIGTERM and SIGINT handling.
//!
//! A signal ends the whole run. Nothing is rolled back: an action that was
//! mid-way is left as it is.

use tokio::signal;

/// Wait for SIGINT (Ctrl+C) or SIGTERM and return the signal's name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}
