//! Pseudo-terminal plumbing for the shell session engine.

mod error;
mod pty;

pub use error::PtyError;
pub use pty::PtyHandle;
pub use pty::PtyRead;
pub use pty::PtyReader;
