use thiserror::Error;

use crate::config::ConfigError;

/// Fatal daemon startup/runtime errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up signal handling: {0}")]
    SignalSetup(String),

    #[error("server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}
