//! Session engine tests against a real `/bin/bash`.

use std::time::Duration;
use std::time::Instant;

use shelld_daemon::shell::Shell;
use shelld_daemon::shell::ShellError;
use shelld_daemon::shell::ShellState;

fn test_shell() -> Shell {
    Shell::new("/bin/bash".to_string(), None, Duration::from_secs(5))
}

fn wait_for_state(shell: &Shell, want: ShellState, deadline: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if shell.state() == want {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    shell.state() == want
}

#[test]
fn test_start_and_state() {
    let shell = test_shell();

    shell.start().expect("the shell should start");
    assert_eq!(shell.state(), ShellState::Locked);

    shell.unlock().expect("unlock");
    assert_eq!(shell.state(), ShellState::Available);
}

#[test]
fn test_double_start_is_rejected() {
    let shell = test_shell();

    shell.start().expect("the shell should start");
    let err = shell.start().unwrap_err();
    assert!(matches!(err, ShellError::NotAvailable(ShellState::Locked)));

    shell.unlock().expect("unlock");
}

#[test]
fn test_run_command() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let output = shell
        .execute(b"echo hello", Duration::from_secs(30))
        .expect("the command should run");
    assert_eq!(output.trim(), "hello");

    shell.unlock().expect("unlock");
}

#[test]
fn test_state_persists_between_commands() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    shell
        .execute(b"export TEST_VAR=myvalue", Duration::from_secs(30))
        .expect("the export should run");

    let output = shell
        .execute(b"echo $TEST_VAR", Duration::from_secs(30))
        .expect("the echo should run");
    assert_eq!(output.trim(), "myvalue");

    shell.unlock().expect("unlock");
}

#[test]
fn test_kill_interrupts_command() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let err = shell
        .execute(b"sleep 30", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, ShellError::Timeout));
    assert_eq!(shell.state(), ShellState::Executing);

    shell.kill().expect("the interrupt should be sent");

    assert!(
        wait_for_state(&shell, ShellState::Locked, Duration::from_secs(10)),
        "the shell should return to locked after the interrupt, got {}",
        shell.state()
    );

    let output = shell
        .execute(b"echo still_alive", Duration::from_secs(30))
        .expect("the shell should still work after kill");
    assert_eq!(output.trim(), "still_alive");

    shell.unlock().expect("unlock");
}

#[test]
fn test_recycle_discards_shell_state() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    shell
        .execute(b"export RECYCLE_TEST=before", Duration::from_secs(30))
        .expect("the export should run");

    shell.unlock().expect("unlock");
    assert_eq!(shell.state(), ShellState::Available);

    shell.start().expect("the shell should restart");
    assert_eq!(shell.state(), ShellState::Locked);

    let output = shell
        .execute(b"echo ${RECYCLE_TEST:-unset}", Duration::from_secs(30))
        .expect("the echo should run");
    assert_eq!(output.trim(), "unset");

    shell.unlock().expect("unlock");
}

#[test]
fn test_multiline_output() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let output = shell
        .execute(b"echo -e 'line1\\nline2\\nline3'", Duration::from_secs(30))
        .expect("the command should run");
    let lines: Vec<&str> = output.trim().split('\n').collect();
    assert_eq!(lines, vec!["line1", "line2", "line3"]);

    shell.unlock().expect("unlock");
}

#[test]
fn test_multiline_command_via_heredoc() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let output = shell
        .execute(
            b"cat <<EOF\nheredoc_line1\nheredoc_line2\nEOF",
            Duration::from_secs(30),
        )
        .expect("the heredoc should run");
    let lines: Vec<&str> = output.trim().split('\n').collect();
    assert_eq!(lines, vec!["heredoc_line1", "heredoc_line2"]);

    shell.unlock().expect("unlock");
}

#[test]
fn test_output_without_trailing_newline() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let output = shell
        .execute(b"printf 'no_newline'", Duration::from_secs(5))
        .expect("printf should run");
    assert_eq!(output, "no_newline");

    let output = shell
        .execute(b"echo -n 'head_test'", Duration::from_secs(5))
        .expect("echo -n should run");
    assert_eq!(output, "head_test");

    shell.unlock().expect("unlock");
}

#[test]
fn test_timeout_leaves_command_running() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let err = shell
        .execute(b"sleep 2 && echo late_result", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, ShellError::Timeout));
    assert_eq!(shell.state(), ShellState::Executing);

    // the slot was reset when this command started and stays readable
    assert_eq!(shell.last_output(), "");

    // the background reader completes the transition on its own
    assert!(
        wait_for_state(&shell, ShellState::Locked, Duration::from_secs(10)),
        "the shell should return to locked after the command finishes, got {}",
        shell.state()
    );

    // the late output is retrievable afterwards
    assert_eq!(shell.last_output().trim(), "late_result");

    shell.unlock().expect("unlock");
}

#[test]
fn test_output_isolation_between_commands() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let first = shell
        .execute(b"echo first_output", Duration::from_secs(30))
        .expect("the first command should run");
    let second = shell
        .execute(b"echo second_output", Duration::from_secs(30))
        .expect("the second command should run");

    assert_eq!(first.trim(), "first_output");
    assert_eq!(second.trim(), "second_output");
    assert!(!second.contains("first_output"));

    shell.unlock().expect("unlock");
}

#[test]
fn test_execute_while_executing_is_rejected() {
    let shell = test_shell();
    shell.start().expect("the shell should start");

    let err = shell
        .execute(b"sleep 2", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, ShellError::Timeout));

    let err = shell
        .execute(b"echo queued", Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, ShellError::NotLocked(ShellState::Executing)));

    assert!(wait_for_state(
        &shell,
        ShellState::Locked,
        Duration::from_secs(10)
    ));
    shell.unlock().expect("unlock");
}
