//! Graceful shutdown on SIGTERM and SIGINT.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Register signal handlers and return a token that cancels on the first
/// SIGTERM or SIGINT. The token is cloned into the HTTP server, the stdio
/// binding, and the session sweeper so they all wind down together.
///
/// Returns an error if signal registration fails.
pub fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
        }
        trigger.cancel();
    });
    Ok(token)
}
