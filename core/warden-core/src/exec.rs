//! Child processes with a hard deadline.
//!
//! stdout and stderr are drained on their own threads while the parent polls
//! `try_wait`, so a chatty child cannot block on a full pipe.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, WardenError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs `command` to completion, killing it once `timeout` elapses.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<ExecOutput> {
    let label = describe(command);
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| WardenError::CommandFailed {
            command: label.clone(),
            details: err.to_string(),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let status = wait_until(&mut child, timeout, &label)?;

    Ok(ExecOutput {
        status,
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
    })
}

/// Runs an argv vector. The first element is the program.
pub fn run_argv(argv: &[String], timeout: Duration) -> Result<ExecOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| WardenError::CommandFailed {
        command: String::new(),
        details: "empty command line".to_string(),
    })?;
    run_with_timeout(Command::new(program).args(args), timeout)
}

/// Like [`run_argv`] but a non-zero exit is an error.
pub fn run_checked(argv: &[String], timeout: Duration) -> Result<ExecOutput> {
    let output = run_argv(argv, timeout)?;
    if output.status.success() {
        return Ok(output);
    }
    Err(WardenError::CommandFailed {
        command: argv.join(" "),
        details: format!("{}: {}", output.status, output.combined().trim()),
    })
}

fn wait_until(child: &mut Child, timeout: Duration, label: &str) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(WardenError::AnalysisTimeout {
                        strategy: label.to_string(),
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(WardenError::io(format!("Failed to wait for {}", label), err));
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn describe(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_both_streams() {
        let output = run_argv(&argv(&["sh", "-c", "echo out; echo err >&2"]), Duration::from_secs(5))
            .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "out\n\nerr\n");
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let result = run_argv(&argv(&["sleep", "5"]), Duration::from_millis(200));
        assert!(matches!(result, Err(WardenError::AnalysisTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn non_zero_exit_is_error_when_checked() {
        assert!(run_checked(&argv(&["sh", "-c", "exit 3"]), Duration::from_secs(5)).is_err());
        assert!(run_argv(&argv(&[]), Duration::from_secs(1)).is_err());
    }
}
