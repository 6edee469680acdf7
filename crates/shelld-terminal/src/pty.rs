use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;

use shelld_common::mutex_lock_or_recover;

use crate::error::PtyError;

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;

/// Outcome of a bounded PTY read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    /// Bytes were read into the buffer.
    Data(usize),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The slave side is gone; the child has exited.
    Closed,
}

/// A child process attached to the slave side of a PTY, plus the master
/// side for I/O. Dropping the handle kills the child if it is still running.
pub struct PtyHandle {
    // keeps the master fd open for the life of the handle
    #[allow(dead_code)]
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master_fd: RawFd,
}

/// Clonable read-side view of a PTY master, so a reader thread can poll the
/// stream while the owning handle stays available for writes and reaping.
#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    fd: RawFd,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill();
        }
    }
}

impl PtyHandle {
    /// Spawns `command` attached to a fresh PTY with `TERM=xterm-256color`.
    pub fn spawn(command: &str, working_directory: Option<&Path>) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        if let Some(dir) = working_directory {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::Open("failed to get master fd".to_string()))?;

        set_non_blocking(master_fd)?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        Ok(Self {
            master: pair.master,
            child,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            master_fd,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn is_running(&mut self) -> bool {
        self.child
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }

    /// Writes all of `data` to the master, retrying short writes.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = mutex_lock_or_recover(&self.writer);
        let mut offset = 0;
        while offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    return Err(PtyError::Write(
                        "write returned 0 bytes, PTY closed".to_string(),
                    ));
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(self.master_fd)?;
                }
                Err(e) => return Err(PtyError::Write(e.to_string())),
            }
        }
        Ok(())
    }

    /// Returns a read-side view that can outlive borrows of the handle.
    pub fn reader(&self) -> PtyReader {
        PtyReader {
            reader: Arc::clone(&self.reader),
            fd: self.master_fd,
        }
    }

    pub fn kill(&mut self) -> Result<(), PtyError> {
        if !self.is_running() {
            return Ok(());
        }

        self.child
            .kill()
            .map_err(|e| PtyError::Spawn(e.to_string()))
    }

    /// Blocks until the child exits and is reaped.
    pub fn wait(&mut self) -> Result<(), PtyError> {
        self.child
            .wait()
            .map(|_| ())
            .map_err(|e| PtyError::Wait(e.to_string()))
    }
}

impl PtyReader {
    /// Reads available bytes, waiting at most `timeout_ms` for the first
    /// byte. Distinguishes an idle PTY (`Timeout`) from a hung-up one
    /// (`Closed`) so callers can detect a dead child.
    pub fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<PtyRead, PtyError> {
        if buf.is_empty() {
            return Ok(PtyRead::Data(0));
        }

        match wait_readable(self.fd, timeout_ms)? {
            Readiness::NotReady => return Ok(PtyRead::Timeout),
            Readiness::HungUp => return Ok(PtyRead::Closed),
            Readiness::Ready => {}
        }

        let mut reader = mutex_lock_or_recover(&self.reader);
        let mut total = 0;
        loop {
            match reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // spurious poll readiness, not a hangup
                    if total == 0 {
                        return Ok(PtyRead::Timeout);
                    }
                    break;
                }
                // Linux reports EIO on the master once the child is gone
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    if total == 0 {
                        return Ok(PtyRead::Closed);
                    }
                    break;
                }
                Err(e) => return Err(PtyError::Read(e.to_string())),
            }
        }

        if total == 0 {
            return Ok(PtyRead::Closed);
        }
        Ok(PtyRead::Data(total))
    }
}

enum Readiness {
    Ready,
    NotReady,
    HungUp,
}

fn set_non_blocking(fd: RawFd) -> Result<(), PtyError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    Ok(())
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<Readiness, PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        return Err(PtyError::Read(io::Error::last_os_error().to_string()));
    }
    if result == 0 {
        return Ok(Readiness::NotReady);
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(PtyError::Read("poll error on PTY".to_string()));
    }

    if pollfd.revents & libc::POLLHUP != 0 && pollfd.revents & libc::POLLIN == 0 {
        return Ok(Readiness::HungUp);
    }

    if pollfd.revents & libc::POLLIN != 0 {
        Ok(Readiness::Ready)
    } else {
        Ok(Readiness::NotReady)
    }
}

fn wait_writable(fd: RawFd) -> Result<(), PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, -1) };
    if result < 0 {
        return Err(PtyError::Write(io::Error::last_os_error().to_string()));
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(PtyError::Write("poll error on PTY".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::time::Instant;

    #[test]
    fn test_spawn_and_read() {
        let pty = PtyHandle::spawn("/bin/sh", None).expect("spawn /bin/sh");
        pty.write(b"printf pty_smoke_test\n").expect("write");

        let reader = pty.reader();
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match reader.read_timeout(&mut chunk, 100).expect("read") {
                PtyRead::Data(n) => {
                    collected.extend_from_slice(&chunk[..n]);
                    if String::from_utf8_lossy(&collected).contains("pty_smoke_test") {
                        return;
                    }
                }
                PtyRead::Timeout => continue,
                PtyRead::Closed => break,
            }
        }
        panic!(
            "expected marker in PTY output, got: {:?}",
            String::from_utf8_lossy(&collected)
        );
    }

    #[test]
    fn test_child_exit_reports_closed() {
        let pty = PtyHandle::spawn("/bin/sh", None).expect("spawn /bin/sh");
        pty.write(b"exit\n").expect("write");

        let reader = pty.reader();
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match reader.read_timeout(&mut chunk, 100).expect("read") {
                PtyRead::Closed => return,
                PtyRead::Data(_) | PtyRead::Timeout => continue,
            }
        }
        panic!("expected PTY to report closed after exit");
    }

    #[test]
    fn test_is_running_after_reap() {
        let mut pty = PtyHandle::spawn("/bin/sh", None).expect("spawn /bin/sh");
        assert!(pty.is_running());
        pty.write(b"exit\n").expect("write");
        pty.wait().expect("wait");
        assert!(!pty.is_running());
    }
}
