//! The shell session engine.
//!
//! Drives one interactive shell through a PTY. A command is wrapped in
//! per-call sentinel markers so its output can be extracted from the raw
//! terminal stream without relying on prompt detection: the stream echoes
//! the command itself, so the end marker only counts when it appears at the
//! start of a line followed by the PTY's CRLF. A background reader owns the
//! `executing -> locked` transition, which keeps a command that outlives its
//! caller's deadline from bleeding output into the next command.

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use shelld_common::mutex_lock_or_recover;
use shelld_terminal::PtyError;
use shelld_terminal::PtyHandle;
use shelld_terminal::PtyRead;
use shelld_terminal::PtyReader;

const READY_DEADLINE: Duration = Duration::from_secs(30);
const READ_CHUNK_BYTES: usize = 4096;
const READ_POLL_MS: i32 = 100;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of the managed shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// No child shell is running.
    Available,
    /// Shell running and idle, awaiting a command.
    Locked,
    /// A command is in flight; its end marker has not been observed yet.
    Executing,
    /// The shell or its PTY failed; only unlock leads out of here.
    Unrecoverable,
}

impl ShellState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellState::Available => "available",
            ShellState::Locked => "locked",
            ShellState::Executing => "executing",
            ShellState::Unrecoverable => "unrecoverable",
        }
    }
}

impl fmt::Display for ShellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("the command timed out waiting for completion")]
    Timeout,
    #[error("the shell cannot be started from state {0}")]
    NotAvailable(ShellState),
    #[error("the shell is not ready (state: {0})")]
    NotLocked(ShellState),
    #[error("the shell process terminated unexpectedly")]
    Terminated,
    #[error("failed to spawn the reader thread: {0}")]
    Reader(String),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

struct ShellInner {
    state: ShellState,
    pty: Option<PtyHandle>,
    // bumped whenever the child shell is replaced or reaped, so a reader
    // from a previous shell cannot touch the current one's state
    generation: u64,
    output_buffer: Vec<u8>,
    current_command: String,
    start_marker: String,
    end_marker: String,
    last_output: String,
}

/// A persistent shell session driven through a PTY.
pub struct Shell {
    inner: Arc<Mutex<ShellInner>>,
    shell_command: String,
    working_directory: Option<PathBuf>,
    kill_grace: Duration,
}

impl Shell {
    pub fn new(
        shell_command: String,
        working_directory: Option<PathBuf>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ShellInner {
                state: ShellState::Available,
                pty: None,
                generation: 0,
                output_buffer: Vec::new(),
                current_command: String::new(),
                start_marker: String::new(),
                end_marker: String::new(),
                last_output: String::new(),
            })),
            shell_command,
            working_directory,
            kill_grace,
        }
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> ShellState {
        mutex_lock_or_recover(&self.inner).state
    }

    /// Returns the output of the last completed command.
    ///
    /// Readable in any state. The slot is reset when a new command starts,
    /// so while a command is executing this is empty; once the reader
    /// observes the end marker the result lands here even if the execute
    /// caller timed out long before.
    pub fn last_output(&self) -> String {
        mutex_lock_or_recover(&self.inner).last_output.clone()
    }

    /// Spawns the shell under a PTY and waits for it to become responsive.
    pub fn start(&self) -> Result<(), ShellError> {
        let mut inner = mutex_lock_or_recover(&self.inner);

        if inner.state != ShellState::Available {
            return Err(ShellError::NotAvailable(inner.state));
        }

        info!(command = %self.shell_command, "starting shell");

        let pty = match PtyHandle::spawn(&self.shell_command, self.working_directory.as_deref()) {
            Ok(pty) => pty,
            Err(err) => {
                inner.state = ShellState::Unrecoverable;
                return Err(err.into());
            }
        };

        inner.output_buffer.clear();

        // verify the shell is alive by echoing a unique marker through it
        let ready_marker = format!("<<<SHELLD_READY_{}>>>", marker_id());
        if let Err(err) = pty.write(format!("echo '{ready_marker}'\n").as_bytes()) {
            inner.state = ShellState::Unrecoverable;
            return Err(err.into());
        }

        let reader = pty.reader();
        if let Err(err) = wait_for_marker(
            &reader,
            &mut inner.output_buffer,
            ready_marker.as_bytes(),
            READY_DEADLINE,
        ) {
            warn!(marker = %ready_marker, "the shell failed to initialize");
            inner.state = ShellState::Unrecoverable;
            return Err(err);
        }

        inner.output_buffer.clear();
        inner.generation += 1;
        inner.pty = Some(pty);
        inner.state = ShellState::Locked;
        info!("shell is ready");
        Ok(())
    }

    /// Runs one command and returns its extracted output.
    ///
    /// If the deadline expires first, returns [`ShellError::Timeout`] while
    /// the command keeps running; the background reader later stores the
    /// output and returns the state to `locked` on its own.
    pub fn execute(&self, command: &[u8], timeout: Duration) -> Result<String, ShellError> {
        let (receiver, generation) = {
            let mut inner = mutex_lock_or_recover(&self.inner);

            if inner.state != ShellState::Locked {
                return Err(ShellError::NotLocked(inner.state));
            }

            inner.state = ShellState::Executing;
            inner.output_buffer.clear();
            inner.last_output.clear();
            inner.current_command = String::from_utf8_lossy(command).into_owned();

            let id = marker_id();
            inner.start_marker = format!("<<<SHELLD_START_{id}>>>");
            inner.end_marker = format!("<<<SHELLD_END_{id}>>>");

            debug!(command = %inner.current_command, ?timeout, "executing command");

            let wrapped = wrap_command(command, &inner.start_marker, &inner.end_marker);

            let Some(pty) = inner.pty.as_ref() else {
                inner.state = ShellState::Unrecoverable;
                return Err(ShellError::Terminated);
            };

            if let Err(err) = pty.write(wrapped.as_bytes()) {
                inner.state = ShellState::Unrecoverable;
                return Err(err.into());
            }

            let reader = pty.reader();
            let generation = inner.generation;
            let end_pattern = format!("\n{}\r\n", inner.end_marker).into_bytes();
            let (sender, receiver) = mpsc::sync_channel(1);
            let reader_inner = Arc::clone(&self.inner);

            if let Err(err) = thread::Builder::new()
                .name("shelld-reader".to_string())
                .spawn(move || read_until_marker(reader_inner, reader, generation, end_pattern, sender))
            {
                inner.state = ShellState::Unrecoverable;
                return Err(ShellError::Reader(err.to_string()));
            }

            (receiver, generation)
        };

        match receiver.recv_timeout(timeout) {
            Ok(Ok(())) => {
                let inner = mutex_lock_or_recover(&self.inner);
                Ok(inner.last_output.clone())
            }
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // the reader stays alive and will finish the transition
                Err(ShellError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let mut inner = mutex_lock_or_recover(&self.inner);
                if inner.generation == generation {
                    inner.state = ShellState::Unrecoverable;
                }
                Err(ShellError::Terminated)
            }
        }
    }

    /// Interrupts the current command by sending Ctrl+C to the PTY.
    ///
    /// The shell itself survives; only the in-flight command is stopped.
    /// A no-op when nothing runs.
    pub fn kill(&self) -> Result<(), ShellError> {
        let inner = mutex_lock_or_recover(&self.inner);

        let Some(pty) = inner.pty.as_ref() else {
            return Ok(());
        };

        info!("sending interrupt to the current command");
        pty.write(&[0x03])?;

        // bash abandons the rest of an interrupted command line, so the
        // wrapped line's own end marker never prints; queue a replacement
        // for the reader to observe once the shell is back at its prompt
        if inner.state == ShellState::Executing {
            let line = format!("echo;echo '{}'\n", inner.end_marker);
            pty.write(line.as_bytes())?;
        }

        Ok(())
    }

    /// Gracefully terminates the shell and returns to `available`.
    pub fn unlock(&self) -> Result<(), ShellError> {
        let mut inner = mutex_lock_or_recover(&self.inner);

        let Some(mut pty) = inner.pty.take() else {
            inner.state = ShellState::Available;
            return Ok(());
        };

        info!("shutting down shell");
        inner.generation += 1;

        let _ = pty.write(b"exit\n");

        let deadline = Instant::now() + self.kill_grace;
        while pty.is_running() && Instant::now() < deadline {
            thread::sleep(REAP_POLL_INTERVAL);
        }
        if pty.is_running() {
            debug!("clean exit timed out, forcing termination");
            let _ = pty.kill();
        }
        if let Err(err) = pty.wait() {
            warn!(error = %err, "failed to reap shell process");
        }

        inner.output_buffer.clear();
        inner.state = ShellState::Available;
        Ok(())
    }
}

/// Reads the PTY until the end marker appears as output, then extracts the
/// command output, stores it, and flips the state back to `locked`. Owns
/// that transition even when the execute caller has already timed out.
fn read_until_marker(
    inner: Arc<Mutex<ShellInner>>,
    reader: PtyReader,
    generation: u64,
    end_pattern: Vec<u8>,
    done: SyncSender<Result<(), ShellError>>,
) {
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    loop {
        let outcome = match reader.read_timeout(&mut chunk, READ_POLL_MS) {
            Ok(outcome) => outcome,
            Err(err) => {
                reader_failed(&inner, generation, &done, err.into());
                return;
            }
        };

        match outcome {
            PtyRead::Timeout => {
                // drop out quietly if unlock reaped the shell under us
                if mutex_lock_or_recover(&inner).generation != generation {
                    return;
                }
            }
            PtyRead::Closed => {
                reader_failed(&inner, generation, &done, ShellError::Terminated);
                return;
            }
            PtyRead::Data(n) => {
                let mut guard = mutex_lock_or_recover(&inner);
                if guard.generation != generation {
                    return;
                }
                guard.output_buffer.extend_from_slice(&chunk[..n]);

                if find_subslice(&guard.output_buffer, &end_pattern).is_some() {
                    let output = extract_output(
                        &guard.output_buffer,
                        &guard.start_marker,
                        &guard.end_marker,
                    );
                    debug!(output_len = output.len(), "command completed");
                    guard.last_output = output;
                    // flip state here so a caller that already timed out
                    // still observes the transition
                    guard.state = ShellState::Locked;
                    drop(guard);
                    let _ = done.send(Ok(()));
                    return;
                }
            }
        }
    }
}

fn reader_failed(
    inner: &Arc<Mutex<ShellInner>>,
    generation: u64,
    done: &SyncSender<Result<(), ShellError>>,
    err: ShellError,
) {
    {
        let mut guard = mutex_lock_or_recover(inner);
        if guard.generation != generation {
            return;
        }
        guard.state = ShellState::Unrecoverable;
    }
    error!(error = %err, "shell read failed");
    let _ = done.send(Err(err));
}

/// Blocks until `marker` appears anywhere in the stream, appending reads to
/// `buffer`. Used for the readiness handshake, where the echo is enough
/// proof of life.
fn wait_for_marker(
    reader: &PtyReader,
    buffer: &mut Vec<u8>,
    marker: &[u8],
    deadline: Duration,
) -> Result<(), ShellError> {
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let started = Instant::now();

    loop {
        if started.elapsed() >= deadline {
            return Err(ShellError::Timeout);
        }
        match reader.read_timeout(&mut chunk, READ_POLL_MS)? {
            PtyRead::Data(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if find_subslice(buffer, marker).is_some() {
                    return Ok(());
                }
            }
            PtyRead::Timeout => continue,
            PtyRead::Closed => return Err(ShellError::Terminated),
        }
    }
}

/// Wraps a command so its output is delimited by the marker pair.
///
/// base64 carries arbitrary multi-line content across the shell's line
/// boundary; the bare `echo` before the end marker guarantees a trailing
/// newline even when the command's own output omits one.
fn wrap_command(command: &[u8], start_marker: &str, end_marker: &str) -> String {
    let encoded = BASE64.encode(command);
    format!(
        "echo '{start_marker}';eval \"$(echo '{encoded}'|base64 -d)\";echo;echo '{end_marker}'\n"
    )
}

/// Extracts the command output from between the markers.
///
/// The start marker only counts followed by CRLF (its own output line, not
/// the command echo). Lines lose one trailing `\r` and empty lines are
/// dropped, which absorbs the synthesized blank line from the wrapper.
fn extract_output(buffer: &[u8], start_marker: &str, end_marker: &str) -> String {
    let text = String::from_utf8_lossy(buffer);

    let start_pattern = format!("{start_marker}\r\n");
    let Some(start) = text.find(&start_pattern) else {
        debug!("start marker not found in output");
        return String::new();
    };
    let rest = &text[start + start_pattern.len()..];

    let Some(end) = rest.find(end_marker) else {
        debug!("end marker not found in output");
        return String::new();
    };
    let body = &rest[..end];

    body.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn marker_id() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "<<<SHELLD_START_1>>>";
    const END: &str = "<<<SHELLD_END_1>>>";

    #[test]
    fn test_state_names() {
        assert_eq!(ShellState::Available.to_string(), "available");
        assert_eq!(ShellState::Locked.to_string(), "locked");
        assert_eq!(ShellState::Executing.to_string(), "executing");
        assert_eq!(ShellState::Unrecoverable.to_string(), "unrecoverable");
    }

    #[test]
    fn test_wrap_command_encodes_base64() {
        let wrapped = wrap_command(b"echo hi", START, END);
        let encoded = BASE64.encode(b"echo hi");
        assert_eq!(
            wrapped,
            format!("echo '{START}';eval \"$(echo '{encoded}'|base64 -d)\";echo;echo '{END}'\n")
        );
    }

    #[test]
    fn test_wrap_command_survives_multiline_input() {
        let command = b"cat <<EOF\nline1\nline2\nEOF";
        let wrapped = wrap_command(command, START, END);
        // the command itself must not appear verbatim on the wrapped line
        assert!(!wrapped.contains("EOF"));
        let encoded = BASE64.encode(command.as_slice());
        assert!(wrapped.contains(&encoded));
    }

    #[test]
    fn test_extract_output_basic() {
        let buffer = format!(
            "echo '{START}';...echoed command...\r\n{START}\r\nhello\r\n\r\n{END}\r\n"
        );
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "hello");
    }

    #[test]
    fn test_extract_output_skips_marker_inside_echo() {
        // the echoed command contains both markers, but neither is followed
        // by CRLF there
        let buffer = format!(
            "$ echo '{START}';eval \"$(echo 'aGk='|base64 -d)\";echo;echo '{END}'\r\n\
             {START}\r\nhi\r\n\r\n{END}\r\n$ "
        );
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "hi");
    }

    #[test]
    fn test_extract_output_multiline() {
        let buffer = format!("{START}\r\nline1\r\nline2\r\nline3\r\n\r\n{END}\r\n");
        assert_eq!(
            extract_output(buffer.as_bytes(), START, END),
            "line1\nline2\nline3"
        );
    }

    #[test]
    fn test_extract_output_without_trailing_newline() {
        // printf 'no_newline' leaves the synthesized blank line holding the
        // only newline before the end marker
        let buffer = format!("{START}\r\nno_newline\r\n{END}\r\n");
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "no_newline");
    }

    #[test]
    fn test_extract_output_empty_command_output() {
        let buffer = format!("{START}\r\n\r\n{END}\r\n");
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "");
    }

    #[test]
    fn test_extract_output_missing_start_marker() {
        let buffer = format!("some noise\r\n{END}\r\n");
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "");
    }

    #[test]
    fn test_extract_output_missing_end_marker() {
        let buffer = format!("{START}\r\npartial output\r\n");
        assert_eq!(extract_output(buffer.as_bytes(), START, END), "");
    }

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"xy"), None);
        assert_eq!(find_subslice(b"ab", b"abcd"), None);
        assert_eq!(find_subslice(b"abcdef", b""), None);
    }

    #[test]
    fn test_markers_are_distinct() {
        let id = marker_id();
        let start = format!("<<<SHELLD_START_{id}>>>");
        let end = format!("<<<SHELLD_END_{id}>>>");
        assert_ne!(start, end);
        assert!(!start.contains(&end));
        assert!(!end.contains(&start));
    }

    #[test]
    fn test_new_shell_is_available() {
        let shell = Shell::new("/bin/bash".to_string(), None, Duration::from_secs(5));
        assert_eq!(shell.state(), ShellState::Available);
        assert_eq!(shell.last_output(), "");
    }

    #[test]
    fn test_execute_before_start_is_rejected() {
        let shell = Shell::new("/bin/bash".to_string(), None, Duration::from_secs(5));
        let err = shell
            .execute(b"echo hello", Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, ShellError::NotLocked(ShellState::Available)));
    }

    #[test]
    fn test_kill_when_not_running_is_noop() {
        let shell = Shell::new("/bin/bash".to_string(), None, Duration::from_secs(5));
        shell.kill().expect("kill should be a no-op");
        assert_eq!(shell.state(), ShellState::Available);
    }

    #[test]
    fn test_unlock_when_not_running_is_noop() {
        let shell = Shell::new("/bin/bash".to_string(), None, Duration::from_secs(5));
        shell.unlock().expect("unlock should be a no-op");
        assert_eq!(shell.state(), ShellState::Available);
    }
}
