//! Guest interpreter processes.
//!
//! A guest is spawned in its own process group with a fully derived
//! environment. Its stdout is read line by line on a background task that
//! feeds a channel, so callers wait on `recv` against a deadline instead of
//! polling. Its stderr goes through a [`StreamPump`].

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, SandboxError};
use crate::sandbox::guest::GuestPrelude;
use crate::sandbox::io::{CapturedText, PumpMode, StreamPump, TruncatingBuffer};
use crate::sandbox::protocol::Request;

/// How long a guest gets between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on one protocol line, independent of the stdout cap.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// One line read from the guest's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdoutLine {
    /// Line text without its terminator.
    pub text: String,
    /// The line was longer than the reader's bound and was cut.
    pub overflowed: bool,
}

/// Outcome of waiting for the next stdout line.
#[derive(Debug)]
pub enum LineEvent {
    /// A line arrived.
    Line(StdoutLine),
    /// The guest closed its stdout.
    Eof,
    /// The deadline passed first.
    Deadline,
}

/// Everything needed to start a guest.
#[derive(Debug)]
pub struct SpawnSpec<'a> {
    /// Resolved interpreter executable.
    pub interpreter: &'a Path,
    /// Rendered prelude.
    pub prelude: GuestPrelude<'a>,
    /// Working directory of the process.
    pub cwd: &'a Path,
    /// Extra variables on top of the prelude environment.
    pub extra_env: &'a std::collections::BTreeMap<String, String>,
    /// Stdout capture cap, used to bound line length.
    pub max_stdout_bytes: usize,
    /// Stderr capture cap.
    pub max_stderr_bytes: usize,
    /// Behavior of the stderr pump at capacity.
    pub stderr_mode: PumpMode,
    /// Line stripped from stderr and counted, marking the end of a request.
    pub stderr_fence: Option<&'static str>,
}

/// A running guest interpreter.
#[derive(Debug)]
pub struct GuestProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<StdoutLine>,
    reader: JoinHandle<()>,
    stderr: TruncatingBuffer,
    pump: Option<StreamPump>,
    fences: Option<watch::Receiver<u64>>,
}

impl GuestProcess {
    /// Spawn a guest according to `spec`.
    pub fn spawn(spec: SpawnSpec<'_>) -> Result<Self> {
        let mut cmd = Command::new(spec.interpreter);
        cmd.args(spec.prelude.interpreter_args())
            .env_clear()
            .envs(spec.prelude.environment())
            .envs(spec.extra_env)
            .current_dir(spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        let pid = child.id();

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(SandboxError::Spawn(std::io::Error::other(
                    "guest stdio pipes were not captured",
                )));
            }
        };

        let max_line = spec.max_stdout_bytes.max(MAX_FRAME_BYTES);
        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_lines(stdout, max_line, tx));

        let stderr_buffer = TruncatingBuffer::new(spec.max_stderr_bytes);
        let (pump, fences) = match spec.stderr_fence {
            Some(fence) => {
                let buffer = stderr_buffer.clone();
                let (pump, fences) =
                    StreamPump::spawn_fenced(stderr, buffer, spec.stderr_mode, fence.as_bytes());
                (pump, Some(fences))
            }
            None => (StreamPump::spawn(stderr, stderr_buffer.clone(), spec.stderr_mode), None),
        };

        tracing::debug!(pid = ?pid, cwd = %spec.cwd.display(), "spawned guest interpreter");

        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            lines,
            reader,
            stderr: stderr_buffer,
            pump: Some(pump),
            fences,
        })
    }

    /// OS process id, if the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one request line.
    pub async fn send(&mut self, request: &Request<'_>) -> Result<()> {
        let line = request
            .to_line()
            .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "guest stdin is closed",
            ))
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin so the guest sees end of input.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Wait for the next stdout line until `deadline`.
    pub async fn next_line(&mut self, deadline: Instant) -> LineEvent {
        match tokio::time::timeout_at(deadline, self.lines.recv()).await {
            Ok(Some(line)) => LineEvent::Line(line),
            Ok(None) => LineEvent::Eof,
            Err(_) => LineEvent::Deadline,
        }
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code if the process has already exited.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        self.child.try_wait().ok().flatten().map(exit_code)
    }

    /// Wait up to `within` for the process to exit.
    pub async fn wait_exit_code(&mut self, within: Duration) -> Option<i32> {
        match tokio::time::timeout(within, self.child.wait()).await {
            Ok(Ok(status)) => Some(exit_code(status)),
            _ => None,
        }
    }

    /// Stderr captured so far, drained.
    pub fn take_stderr(&self) -> CapturedText {
        self.stderr.take()
    }

    /// Wait up to `within` until the stderr pump has passed `count` fences.
    ///
    /// Returns `false` on timeout, when the stream ended first, or when the
    /// guest was spawned without a fence.
    pub async fn wait_stderr_fences(&mut self, count: u64, within: Duration) -> bool {
        let Some(fences) = self.fences.as_mut() else {
            return false;
        };
        matches!(
            tokio::time::timeout(within, fences.wait_for(|seen| *seen >= count)).await,
            Ok(Ok(_))
        )
    }

    /// Let the stderr pump reach end of stream (bounded by `grace`) and drain it.
    pub async fn finish_stderr(&mut self, grace: Duration) -> CapturedText {
        if let Some(pump) = self.pump.take() {
            pump.finish(grace).await;
        }
        self.stderr.take()
    }

    /// Terminate the whole process group: SIGTERM, `grace`, then SIGKILL.
    ///
    /// Returns the exit code once the process is reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(exit_code(status));
        }

        self.stdin = None;
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::Terminate);
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            return Some(exit_code(status));
        }

        tracing::warn!(pid = ?self.pid, "guest ignored SIGTERM, killing");
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::Kill);
        }
        let _ = self.child.start_kill();
        self.child.wait().await.ok().map(exit_code)
    }

    /// Stop background tasks. The process itself is killed on drop.
    pub fn release(&mut self) {
        self.stdin = None;
        self.reader.abort();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for GuestProcess {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exit code of a finished process; a signal `n` maps to `128 + n`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the group created at spawn.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, error = %err, "failed to signal guest process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

async fn read_lines<R>(stdout: R, max_line: usize, tx: mpsc::Sender<StdoutLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let overflowed = match read_bounded_line(&mut reader, &mut buf, max_line).await {
            Ok(Some(overflowed)) => overflowed,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "guest stdout reader stopped");
                break;
            }
        };
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = StdoutLine {
            text: String::from_utf8_lossy(&buf).into_owned(),
            overflowed,
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Read one `\n`-terminated line, keeping at most `max` bytes of it.
///
/// Returns `None` at end of stream, otherwise whether the line was cut.
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    let mut overflowed = false;
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(overflowed));
        }
        read_any = true;

        let (used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        if used > room {
            buf.extend_from_slice(&available[..room]);
            overflowed = true;
        } else {
            buf.extend_from_slice(&available[..used]);
        }
        reader.consume(used);

        if complete {
            return Ok(Some(overflowed));
        }
    }
}
