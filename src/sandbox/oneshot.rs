//! Disposable one-process-per-call execution.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, SandboxError};
use crate::sandbox::guest::{GuestMode, GuestPrelude};
use crate::sandbox::io::PumpMode;
use crate::sandbox::options::EffectiveConfig;
use crate::sandbox::process::{GuestProcess, LineEvent, SpawnSpec, KILL_GRACE};
use crate::sandbox::protocol::{Request, RequestOptions};
use crate::sandbox::result::{ExecutionResult, FrameCollector};

/// How long output is still collected after the `_done` frame.
pub const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Runs each call in a fresh guest inside a fresh temporary directory.
#[derive(Debug, Clone)]
pub struct OneshotRunner {
    interpreter: PathBuf,
}

impl OneshotRunner {
    /// Runner spawning `interpreter`, which must already be resolved.
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// Execute `code` once under `config`.
    pub async fn run(&self, config: &EffectiveConfig, code: &str) -> Result<ExecutionResult> {
        let started = std::time::Instant::now();
        let policy = &config.policy;
        let deadline = Instant::now() + policy.timeout;

        let workdir = tempfile::Builder::new().prefix("pyexec-").tempdir()?;
        // A fresh directory has no symlinks, so creating the requested subdirectory is safe.
        if !config.cwd.as_os_str().is_empty() {
            std::fs::create_dir_all(workdir.path().join(&config.cwd))?;
        }
        let cwd = config.resolve_cwd(workdir.path())?;

        let mut guest = GuestProcess::spawn(SpawnSpec {
            interpreter: &self.interpreter,
            prelude: GuestPrelude::new(policy, GuestMode::Oneshot),
            cwd: workdir.path(),
            extra_env: &config.env,
            max_stdout_bytes: policy.max_stdout_bytes,
            max_stderr_bytes: policy.max_stderr_bytes,
            stderr_mode: PumpMode::StopOnTruncate,
            stderr_fence: None,
        })?;
        let pid = guest.pid();

        let request = Request::Exec {
            code,
            opt: RequestOptions {
                cwd: Some(cwd.to_string_lossy().into_owned()),
                print_last_expression: config.print_last_expression,
            },
        };
        if let Err(e) = guest.send(&request).await {
            guest.terminate(KILL_GRACE).await;
            return Err(e);
        }
        guest.close_stdin();

        let mut collector = FrameCollector::new(policy.max_stdout_bytes);
        let mut eof = false;
        while !collector.is_done() {
            match guest.next_line(deadline).await {
                LineEvent::Line(line) => {
                    collector.accept(line);
                }
                LineEvent::Eof => {
                    eof = true;
                    break;
                }
                LineEvent::Deadline => {
                    tracing::warn!(?pid, timeout = ?policy.timeout, "oneshot execution timed out");
                    guest.terminate(KILL_GRACE).await;
                    return Err(SandboxError::Timeout(policy.timeout));
                }
            }
        }

        let os_exit = if eof {
            // Stdout closed without `_done`: the process is exiting on its own.
            let remaining = deadline.saturating_duration_since(Instant::now());
            match guest.wait_exit_code(remaining).await {
                Some(code) => Some(code),
                None => {
                    tracing::warn!(
                        ?pid,
                        "guest closed stdout but did not exit before the deadline"
                    );
                    guest.terminate(KILL_GRACE).await;
                    return Err(SandboxError::Timeout(policy.timeout));
                }
            }
        } else {
            let grace_end = Instant::now() + DRAIN_GRACE;
            while let LineEvent::Line(line) = guest.next_line(grace_end).await {
                collector.accept(line);
            }
            guest.wait_exit_code(DRAIN_GRACE).await
        };

        let exit_code = collector.resolve_exit(os_exit);
        // Reaps a guest that lingers after `_done` (e.g. non-daemon threads).
        guest.terminate(KILL_GRACE).await;
        let stderr = guest.finish_stderr(DRAIN_GRACE).await;
        let elapsed = started.elapsed();

        tracing::debug!(
            ?pid,
            exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "oneshot execution finished"
        );

        Ok(collector.finish(exit_code, stderr, policy.max_stderr_bytes, elapsed))
    }
}
