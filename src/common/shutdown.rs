//! Shutdown signalling for acquisition runs
//!
//! One broadcast channel carries every reason to stop: Ctrl+C, the end of
//! the input stream and a completed single-shot trigger. The acquisition
//! controller subscribes its decode loop and hands clones of the sender to
//! the tasks allowed to end the run.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Create a shutdown channel that fires on Ctrl+C
///
/// The returned receiver keeps the channel open until the run subscribes,
/// so a Ctrl+C that arrives during setup is not lost.
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, stopping acquisition");
                request_shutdown(&tx_clone, "ctrl-c");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
    });

    (tx, rx)
}

/// Ask every subscriber to stop; returns false when nobody is listening
pub fn request_shutdown(tx: &ShutdownSender, reason: &str) -> bool {
    match tx.send(()) {
        Ok(receivers) => {
            debug!(reason, receivers, "Shutdown requested");
            true
        }
        Err(_) => {
            debug!(reason, "Shutdown requested with no subscribers");
            false
        }
    }
}
