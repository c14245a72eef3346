use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Cancel a fresh token on the first SIGTERM or SIGINT.
///
/// Every long-running component takes a clone and winds down when it fires.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, stopping"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, stopping"),
        }
        trigger.cancel();
    });

    Ok(token)
}
