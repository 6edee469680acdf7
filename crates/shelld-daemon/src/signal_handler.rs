//! Signal handling for orchestrated shutdown.
//!
//! SIGINT and SIGTERM both trigger the same shutdown path. The idle
//! watchdog and die-on-unlock raise SIGTERM on the process itself so they
//! funnel through here as well.

use std::thread;
use std::thread::JoinHandle;

use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;
use tokio::sync::watch;
use tracing::info;

use crate::error::DaemonError;

pub struct SignalHandler {
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl SignalHandler {
    /// Sets up signal handling; the first SIGINT or SIGTERM sends `true`
    /// on `shutdown`.
    pub fn setup(shutdown: watch::Sender<bool>) -> Result<Self, DaemonError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;

        let handle = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "received signal, initiating shutdown");
                    let _ = shutdown.send(true);
                }
            })
            .map_err(|e| {
                DaemonError::SignalSetup(format!("failed to spawn signal handler: {e}"))
            })?;

        Ok(Self { handle })
    }
}
