//! Subprocess execution with a deadline and captured stderr

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug)]
pub enum SubprocessError {
    Io(std::io::Error),
    /// The deadline elapsed; the child was killed.
    Timeout,
}

impl std::fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "subprocess failed to run: {e}"),
            Self::Timeout => write!(f, "subprocess killed after deadline"),
        }
    }
}

impl std::error::Error for SubprocessError {}

impl From<std::io::Error> for SubprocessError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Run a command to completion with a wall-clock deadline.
///
/// stdout/stderr are drained on separate threads so a chatty child can
/// never fill a pipe and deadlock against our poll loop.
pub fn run_with_deadline(
    command: &mut Command,
    deadline: Duration,
) -> Result<CommandOutput, SubprocessError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if started.elapsed() >= deadline => {
                kill_and_reap(&mut child);
                return Err(SubprocessError::Timeout);
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(CommandOutput {
        status: status.code(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!("failed to kill timed-out subprocess: {e}");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output = run_with_deadline(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(output.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(output.stderr_utf8().trim(), "err");
    }

    #[test]
    fn nonzero_exit_reported() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let output = run_with_deadline(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(!output.success());
        assert_eq!(output.status, Some(3));
    }

    #[test]
    fn deadline_kills_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let err = run_with_deadline(&mut cmd, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout));
    }

    #[test]
    fn missing_binary_is_io_error() {
        let mut cmd = Command::new("/nonexistent/definitely-not-here");
        let err = run_with_deadline(&mut cmd, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SubprocessError::Io(_)));
    }
}
