use thiserror::Error;

/// PTY operation errors.
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(String),
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("failed to write to PTY: {0}")]
    Write(String),
    #[error("failed to read from PTY: {0}")]
    Read(String),
    #[error("failed to wait for process: {0}")]
    Wait(String),
}
