//! Lifecycle hook execution.
//!
//! Hooks run in their own helper shell, never in the session's shell, so a
//! misbehaving hook cannot disturb the session state. Hook failure is
//! logged and never propagated.

use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::error;
use tracing::info;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the configured lock/unlock hook commands.
#[derive(Debug, Clone)]
pub struct HookRunner {
    shell: String,
    lock: String,
    unlock: String,
}

impl HookRunner {
    pub fn new(shell: String, lock: String, unlock: String) -> Self {
        Self {
            shell,
            lock,
            unlock,
        }
    }

    /// Runs the lock hook if configured.
    pub fn run_lock(&self, key: &str, deadline: Option<Duration>) {
        self.run("lock", &self.lock, key, deadline);
    }

    /// Runs the unlock hook if configured.
    pub fn run_unlock(&self, key: &str, deadline: Option<Duration>) {
        self.run("unlock", &self.unlock, key, deadline);
    }

    fn run(&self, name: &'static str, command: &str, key: &str, deadline: Option<Duration>) {
        if command.is_empty() {
            return;
        }

        info!(hook = name, command, "running hook");

        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env("SHELLD_KEY", key)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                error!(hook = name, command, error = %err, "the hook failed to spawn");
                return;
            }
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    info!(hook = name, "the hook completed");
                    return;
                }
                Ok(Some(status)) => {
                    error!(hook = name, command, %status, "the hook failed");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(hook = name, error = %err, "the hook could not be waited on");
                    return;
                }
            }

            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    error!(hook = name, command, "the hook deadline expired, terminating it");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
            }

            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hooks(lock: &str, unlock: &str) -> HookRunner {
        HookRunner::new("/bin/sh".to_string(), lock.to_string(), unlock.to_string())
    }

    #[test]
    fn test_empty_command_is_noop() {
        let hooks = test_hooks("", "");
        hooks.run_lock("test-key", None);
        hooks.run_unlock("test-key", None);
    }

    #[test]
    fn test_lock_hook_executes_command() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = dir.path().join("lock_marker");
        let hooks = test_hooks(&format!("touch {}", marker.display()), "");

        hooks.run_lock("test-key", None);

        assert!(marker.exists(), "the lock hook should create the marker file");
    }

    #[test]
    fn test_unlock_hook_executes_command() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = dir.path().join("unlock_marker");
        let hooks = test_hooks("", &format!("touch {}", marker.display()));

        hooks.run_unlock("test-key", None);

        assert!(
            marker.exists(),
            "the unlock hook should create the marker file"
        );
    }

    #[test]
    fn test_hook_sees_session_key() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let out = dir.path().join("env_test");
        let hooks = test_hooks(&format!("echo $SHELLD_KEY > {}", out.display()), "");

        hooks.run_lock("my-secret-key", None);

        let content = std::fs::read_to_string(&out).expect("read hook output");
        assert_eq!(content, "my-secret-key\n");
    }

    #[test]
    fn test_hook_deadline_kills_overrunning_command() {
        let hooks = test_hooks("sleep 10", "");

        let started = Instant::now();
        hooks.run_lock("test-key", Some(Duration::from_millis(100)));
        let elapsed = started.elapsed();

        assert!(
            elapsed < Duration::from_secs(2),
            "the hook should have been terminated quickly, took {elapsed:?}"
        );
    }

    #[test]
    fn test_hook_failure_does_not_propagate() {
        let hooks = test_hooks("exit 7", "");
        hooks.run_lock("test-key", None);
    }

    #[test]
    fn test_hook_with_custom_shell() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = dir.path().join("bash_test");
        let hooks = HookRunner::new(
            "/bin/bash".to_string(),
            format!("touch {}", marker.display()),
            String::new(),
        );

        hooks.run_lock("test-key", None);

        assert!(marker.exists());
    }
}
