use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for pipes to close after killing the process group.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Result of a subprocess run under a deadline.
#[derive(Debug)]
pub enum CommandOutcome {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout: String,
        stderr: String,
    },
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { status, .. } if status.success())
    }

    pub fn stdout(&self) -> &str {
        match self {
            Self::Exited { stdout, .. } | Self::TimedOut { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            Self::Exited { stderr, .. } | Self::TimedOut { stderr, .. } => stderr,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Trimmed stderr, or the exit status when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr().trim();
        if !stderr.is_empty() {
            return stderr.to_owned();
        }
        match self {
            Self::Exited { status, .. } => match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_owned(),
            },
            Self::TimedOut { .. } => "timed out".to_owned(),
        }
    }
}

/// Run `cmd` to completion or until `timeout` elapses, capturing output.
///
/// The child gets its own process group so a timeout kills everything it
/// spawned, not just the direct child. The deadline also covers draining the
/// output pipes, which a backgrounded grandchild may hold open after the
/// direct child has exited.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    stdin: Option<&[u8]>,
) -> Result<CommandOutcome, std::io::Error> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .process_group(0);

    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_vec();
        // A child that never reads stdin must not block us: write on a thread.
        thread::spawn(move || {
            let _ = pipe.write_all(&input);
        });
    }
    let (tx, rx) = mpsc::channel();
    let mut pending = 0;
    if let Some(pipe) = child.stdout.take() {
        spawn_reader(Stream::Stdout, pipe, tx.clone());
        pending += 1;
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_reader(Stream::Stderr, pipe, tx.clone());
        pending += 1;
    }
    drop(tx);

    let pgid = child.id();
    let deadline = Instant::now() + timeout;
    let mut status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            kill_group(pgid);
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut killed = status.is_none();
    while pending > 0 {
        let wait = if killed {
            KILL_GRACE
        } else {
            deadline.saturating_duration_since(Instant::now())
        };
        match rx.recv_timeout(wait) {
            Ok((Stream::Stdout, bytes)) => stdout = bytes,
            Ok((Stream::Stderr, bytes)) => stderr = bytes,
            Err(RecvTimeoutError::Timeout) if !killed => {
                debug!("pipes still open after exit; killing process group {pgid}");
                kill_group(pgid);
                killed = true;
                status = None;
                continue;
            }
            Err(_) => break,
        }
        pending -= 1;
    }

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    Ok(match status {
        Some(status) => CommandOutcome::Exited {
            status,
            stdout,
            stderr,
        },
        None => CommandOutcome::TimedOut { stdout, stderr },
    })
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Stream,
    mut pipe: R,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}

#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill() with a negative pid signals the process group we created
    // via process_group(0); it has no memory-safety preconditions.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_status() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]),
            Duration::from_secs(5),
            None,
        )
        .unwrap();
        assert!(!out.success());
        assert_eq!(out.stdout().trim(), "hello");
        assert_eq!(out.diagnostic(), "oops");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_with_timeout(
            &mut Command::new("cat"),
            Duration::from_secs(5),
            Some(b"piped input"),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout(), "piped input");
    }

    #[test]
    fn kills_on_timeout() {
        let start = Instant::now();
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "sleep 30"]),
            Duration::from_millis(200),
            None,
        )
        .unwrap();
        assert!(out.timed_out());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn deadline_covers_background_grandchild() {
        let start = Instant::now();
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "sleep 6 & echo hi"]),
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(4), "{:?}", start.elapsed());
        assert!(out.timed_out());
        assert_eq!(out.stdout().trim(), "hi");
    }
}
