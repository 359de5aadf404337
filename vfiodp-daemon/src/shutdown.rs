//! Process stop signal for vfiodpd.
//!
//! SIGINT and SIGTERM flip a `watch` channel that every plugin loop observes.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Install signal handlers and return the stop receiver.
pub fn stop_signal() -> std::io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }

        let _ = tx.send(true);
    });

    Ok(rx)
}
