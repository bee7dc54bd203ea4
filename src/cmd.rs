use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const TERMINATE_POLL_INTERVAL_MS: u64 = 50;
const OUTPUT_POLL_INTERVAL_MS: u64 = 50;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// How a child ended up stopping in [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Forced,
}

/// Asks `child` to stop, waits up to `grace`, then kills it. Never fails; the
/// child is reaped before returning.
pub fn terminate(child: &mut Child, grace: Duration) -> Termination {
    if let Ok(Some(_)) = child.try_wait() {
        return Termination::AlreadyExited;
    }

    request_stop(child);

    let started = Instant::now();
    while started.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(_)) => return Termination::Graceful,
            Ok(None) => thread::sleep(Duration::from_millis(TERMINATE_POLL_INTERVAL_MS)),
            Err(_) => break,
        }
    }

    kill_tree(child);
    Termination::Forced
}

#[derive(Debug, thiserror::Error)]
pub enum CommandRunError {
    #[error("could not start: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed while running: {0}")]
    Wait(#[source] std::io::Error),
    #[error("timed out after {}s", .0.as_secs_f32())]
    TimedOut(Duration),
}

/// Runs `cmd` to completion capturing stdout/stderr, killing it once
/// `timeout` elapses.
pub fn output_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> std::result::Result<Output, CommandRunError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || drain(stdout));
    let stderr_handle = thread::spawn(move || drain(stderr));

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) if started.elapsed() >= timeout => {
                kill_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CommandRunError::TimedOut(timeout));
            }
            Ok(None) => thread::sleep(Duration::from_millis(OUTPUT_POLL_INTERVAL_MS)),
            Err(err) => {
                kill_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

#[cfg(unix)]
fn request_stop(child: &Child) {
    let pid = child.id().to_string();
    let _ = command("kill")
        .args(["-TERM", &pid])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(windows)]
fn request_stop(child: &Child) {
    let pid = child.id().to_string();
    let _ = command("taskkill")
        .args(["/PID", &pid, "/T"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(any(unix, windows)))]
fn request_stop(_child: &Child) {}

fn kill_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn terminate_stops_a_sleeping_child_gracefully() {
        let mut child = command("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let outcome = terminate(&mut child, Duration::from_secs(2));
        assert_eq!(outcome, Termination::Graceful);
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn terminate_escalates_when_term_is_ignored() {
        let mut child = command("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sh");
        // Give the shell a moment to install the trap.
        thread::sleep(Duration::from_millis(200));
        let outcome = terminate(&mut child, Duration::from_millis(300));
        assert_eq!(outcome, Termination::Forced);
    }

    #[test]
    fn output_with_timeout_captures_both_streams() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output = output_with_timeout(&mut cmd, Duration::from_secs(5)).expect("run");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[test]
    fn output_with_timeout_kills_slow_commands() {
        let mut cmd = command("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = output_with_timeout(&mut cmd, Duration::from_millis(300)).expect_err("timeout");
        assert!(matches!(err, CommandRunError::TimedOut(_)));
        assert_eq!(err.to_string(), "timed out after 0.3s");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_failure_keeps_the_io_error_as_source() {
        use std::error::Error as _;

        let mut cmd = command("audiohub-no-such-tool");
        let err = output_with_timeout(&mut cmd, Duration::from_secs(1)).expect_err("spawn");
        assert!(matches!(err, CommandRunError::Spawn(_)));
        assert!(err.to_string().starts_with("could not start: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn terminate_on_exited_child_is_a_no_op() {
        let mut child = command("true").spawn().expect("spawn true");
        child.wait().expect("wait");
        assert_eq!(
            terminate(&mut child, Duration::from_millis(100)),
            Termination::AlreadyExited
        );
    }
}
