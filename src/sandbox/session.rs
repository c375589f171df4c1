//! Long-lived guest interpreters with a persistent namespace.
//!
//! A [`DaemonSession`] owns one guest process. The process and its protocol
//! channel live behind a tokio mutex, so start, exec and shutdown on one
//! session never interleave their frames while different sessions run
//! concurrently.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant as StdInstant};

use anyhow::anyhow;
use tokio::time::Instant;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::ExecutionPolicy;
use crate::sandbox::guest::{GuestMode, GuestPrelude};
use crate::sandbox::io::PumpMode;
use crate::sandbox::options::EffectiveConfig;
use crate::sandbox::process::{GuestProcess, LineEvent, SpawnSpec, KILL_GRACE};
use crate::sandbox::protocol::{classify, GuestLine, Request, RequestOptions, STDERR_FENCE};
use crate::sandbox::result::{ExecutionResult, FrameCollector};

/// How long stderr may trail the `_done` frame of a call.
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Lifecycle of a [`DaemonSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no process yet.
    NotStarted,
    /// Process spawned, waiting for readiness.
    Starting,
    /// Idle and alive.
    Ready,
    /// A call is in flight.
    Executing,
    /// Final: shut down, evicted, failed to start or died.
    Terminated,
}

/// Working area of a session.
#[derive(Debug)]
pub enum SessionRoot {
    /// Temporary directory removed with the session.
    Temporary(tempfile::TempDir),
    /// Caller-provided directory, left in place.
    Directory(PathBuf),
}

impl SessionRoot {
    /// Absolute path of the root.
    pub fn path(&self) -> &Path {
        match self {
            SessionRoot::Temporary(dir) => dir.path(),
            SessionRoot::Directory(path) => path,
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    guest: Option<GuestProcess>,
    /// A timed-out request whose `_done` frame has not been read yet.
    outstanding: bool,
    /// Exec requests written to the current guest.
    sent: u64,
    /// Extra environment the guest was started with.
    env: BTreeMap<String, String>,
}

/// One guest process serving a session id.
#[derive(Debug)]
pub struct DaemonSession {
    id: String,
    root: SessionRoot,
    interpreter: PathBuf,
    policy: Arc<ExecutionPolicy>,
    channel: tokio::sync::Mutex<Channel>,
    state: Mutex<SessionState>,
    created_at: StdInstant,
    last_used: Mutex<StdInstant>,
    /// Outstanding [`SessionClaim`]s.
    claims: AtomicUsize,
}

/// A session handed out by the pool, counted as busy until dropped.
#[derive(Debug)]
pub struct SessionClaim {
    session: Arc<DaemonSession>,
}

impl SessionClaim {
    /// The claimed session.
    pub fn session(&self) -> &Arc<DaemonSession> {
        &self.session
    }
}

impl Deref for SessionClaim {
    type Target = DaemonSession;

    fn deref(&self) -> &DaemonSession {
        &self.session
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.session.claims.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DaemonSession {
    /// A session that has not started its guest yet.
    pub fn new(
        id: impl Into<String>,
        root: SessionRoot,
        interpreter: impl Into<PathBuf>,
        policy: Arc<ExecutionPolicy>,
    ) -> Self {
        let now = StdInstant::now();
        Self {
            id: id.into(),
            root,
            interpreter: interpreter.into(),
            policy,
            channel: tokio::sync::Mutex::new(Channel::default()),
            state: Mutex::new(SessionState::NotStarted),
            created_at: now,
            last_used: Mutex::new(now),
            claims: AtomicUsize::new(0),
        }
    }

    /// Mark the session busy for as long as the returned claim lives.
    pub fn claim(self: &Arc<Self>) -> SessionClaim {
        self.claims.fetch_add(1, Ordering::AcqRel);
        SessionClaim {
            session: Arc::clone(self),
        }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Absolute working-directory root.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn touch(&self) {
        *lock(&self.last_used) = StdInstant::now();
    }

    /// When the session was created.
    pub fn created_at(&self) -> StdInstant {
        self.created_at
    }

    /// When the session last started or finished a call.
    pub fn last_used(&self) -> StdInstant {
        *lock(&self.last_used)
    }

    /// Time since last use.
    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the session is claimed or another task holds the protocol channel.
    pub fn is_busy(&self) -> bool {
        self.claims.load(Ordering::Acquire) > 0 || self.channel.try_lock().is_err()
    }

    /// Liveness check; detects a dead guest lazily.
    ///
    /// A busy session counts as alive. A session that has not started yet is
    /// alive as far as callers waiting to start it are concerned.
    pub fn is_alive(&self) -> bool {
        let Ok(mut channel) = self.channel.try_lock() else {
            return self.state() != SessionState::Terminated;
        };
        match self.state() {
            SessionState::Terminated => false,
            SessionState::NotStarted => true,
            _ if channel.guest.as_mut().is_some_and(GuestProcess::is_alive) => true,
            _ => {
                tracing::info!(session_id = %self.id, "session guest died");
                if let Some(mut guest) = channel.guest.take() {
                    guest.release();
                }
                self.set_state(SessionState::Terminated);
                false
            }
        }
    }

    /// Spawn the guest and wait for its readiness frame.
    ///
    /// No-op when the session is already ready. `extra_env` only applies to
    /// the process started here.
    pub async fn start(&self, extra_env: &BTreeMap<String, String>) -> Result<()> {
        let mut channel = self.channel.lock().await;
        match self.state() {
            SessionState::NotStarted => {}
            SessionState::Terminated => {
                return Err(SandboxError::SessionTerminated(self.id.clone()));
            }
            _ => {
                if channel.guest.as_mut().is_some_and(GuestProcess::is_alive) {
                    if *extra_env != channel.env {
                        tracing::warn!(
                            session_id = %self.id,
                            "environment differs from session start; ignored"
                        );
                    }
                    return Ok(());
                }
                self.set_state(SessionState::Terminated);
                return Err(SandboxError::SessionTerminated(self.id.clone()));
            }
        }

        self.set_state(SessionState::Starting);
        let mut guest = match GuestProcess::spawn(SpawnSpec {
            interpreter: &self.interpreter,
            prelude: GuestPrelude::new(&self.policy, GuestMode::Session),
            cwd: self.root.path(),
            extra_env,
            max_stdout_bytes: self.policy.max_stdout_bytes,
            max_stderr_bytes: self.policy.max_stderr_bytes,
            stderr_mode: PumpMode::Drain,
            stderr_fence: Some(STDERR_FENCE),
        }) {
            Ok(guest) => guest,
            Err(e) => {
                self.set_state(SessionState::Terminated);
                return Err(e);
            }
        };

        let deadline = Instant::now() + self.policy.timeout;
        let failure = loop {
            match guest.next_line(deadline).await {
                LineEvent::Line(line) => match classify(&line.text) {
                    GuestLine::Frame { frame, .. } if frame.is_ready() => break None,
                    other => {
                        tracing::debug!(
                            session_id = %self.id,
                            line = ?other,
                            "output before readiness"
                        )
                    }
                },
                LineEvent::Eof => {
                    let status = guest.wait_exit_code(KILL_GRACE).await;
                    let stderr = guest.take_stderr();
                    break Some(anyhow!(
                        "guest exited before readiness (exit {status:?}): {}",
                        stderr.text.trim()
                    ));
                }
                LineEvent::Deadline => {
                    break Some(anyhow!(
                        "no readiness frame within {:?}",
                        self.policy.timeout
                    ))
                }
            }
        };

        if let Some(err) = failure {
            tracing::warn!(session_id = %self.id, error = %err, "session failed to start");
            guest.terminate(KILL_GRACE).await;
            self.set_state(SessionState::Terminated);
            return Err(SandboxError::StartupFailed(err));
        }

        tracing::info!(session_id = %self.id, pid = ?guest.pid(), "session ready");
        channel.guest = Some(guest);
        channel.outstanding = false;
        channel.sent = 0;
        channel.env = extra_env.clone();
        self.touch();
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// Execute one cell in the session's namespace.
    ///
    /// On timeout the guest is left running; the next call first collects
    /// the timed-out cell's remaining output.
    pub async fn exec(&self, config: &EffectiveConfig, code: &str) -> Result<ExecutionResult> {
        let started = std::time::Instant::now();
        let mut channel = self.channel.lock().await;
        let channel = &mut *channel;

        match self.state() {
            SessionState::Ready => {}
            SessionState::NotStarted => {
                return Err(SandboxError::InvalidArgument(format!(
                    "session {} has not been started",
                    self.id
                )))
            }
            _ => return Err(SandboxError::SessionTerminated(self.id.clone())),
        }

        if !channel.guest.as_mut().is_some_and(GuestProcess::is_alive) {
            tracing::info!(session_id = %self.id, "session guest died between calls");
            if let Some(mut guest) = channel.guest.take() {
                guest.release();
            }
            self.set_state(SessionState::Terminated);
            return Err(SandboxError::SessionTerminated(self.id.clone()));
        }
        let Some(guest) = channel.guest.as_mut() else {
            return Err(SandboxError::SessionTerminated(self.id.clone()));
        };

        // Confinement is checked on every call, before the guest is contacted.
        let cwd = config.resolve_cwd(self.root.path())?;

        self.set_state(SessionState::Executing);
        self.touch();

        let policy = &self.policy;
        let deadline = Instant::now() + policy.timeout;
        let mut collector = FrameCollector::new(policy.max_stdout_bytes);

        while channel.outstanding {
            match guest.next_line(deadline).await {
                LineEvent::Line(line) => {
                    if collector.accept_stale(line) {
                        channel.outstanding = false;
                    }
                }
                LineEvent::Eof => break,
                LineEvent::Deadline => {
                    self.touch();
                    self.set_state(SessionState::Ready);
                    tracing::warn!(
                        session_id = %self.id,
                        "previous cell still running at deadline"
                    );
                    return Err(SandboxError::Timeout(policy.timeout));
                }
            }
        }

        let request = Request::Exec {
            code,
            opt: RequestOptions {
                cwd: Some(cwd.to_string_lossy().into_owned()),
                print_last_expression: config.print_last_expression,
            },
        };

        let sent = if channel.outstanding {
            // Stdout closed while draining; fall through to death handling.
            Ok(())
        } else {
            guest.send(&request).await
        };

        let mut died = channel.outstanding;
        match sent {
            Ok(()) if !died => channel.sent += 1,
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to send request");
                died = true;
            }
        }

        while !died && !collector.is_done() {
            match guest.next_line(deadline).await {
                LineEvent::Line(line) => {
                    collector.accept(line);
                }
                LineEvent::Eof => died = true,
                LineEvent::Deadline => {
                    channel.outstanding = true;
                    self.touch();
                    self.set_state(SessionState::Ready);
                    tracing::warn!(
                        session_id = %self.id,
                        timeout = ?policy.timeout,
                        "session execution timed out"
                    );
                    return Err(SandboxError::Timeout(policy.timeout));
                }
            }
        }

        let os_exit = if died {
            guest.wait_exit_code(KILL_GRACE).await
        } else {
            guest.try_exit_code()
        };
        let exit_code = collector.resolve_exit(os_exit);
        let stderr = if died || os_exit.is_some() {
            guest.finish_stderr(STDERR_GRACE).await
        } else {
            // The guest fences stderr before `_done`; wait until the pump has
            // read this call's fence so no output crosses into the next call.
            if !guest.wait_stderr_fences(channel.sent, STDERR_GRACE).await {
                tracing::debug!(session_id = %self.id, "stderr fence not seen within grace");
            }
            guest.take_stderr()
        };

        if died || os_exit.is_some() {
            tracing::info!(session_id = %self.id, exit_code, "session guest exited during call");
            if let Some(mut guest) = channel.guest.take() {
                guest.terminate(KILL_GRACE).await;
                guest.release();
            }
            channel.outstanding = false;
            self.set_state(SessionState::Terminated);
        } else {
            self.set_state(SessionState::Ready);
        }
        self.touch();

        let elapsed = started.elapsed();
        tracing::debug!(
            session_id = %self.id,
            exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "session execution finished"
        );
        Ok(collector.finish(exit_code, stderr, policy.max_stderr_bytes, elapsed))
    }

    /// Stop the guest: `shutdown` request, then SIGTERM, then SIGKILL.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let mut channel = self.channel.lock().await;
        let Some(mut guest) = channel.guest.take() else {
            self.set_state(SessionState::Terminated);
            return;
        };

        if guest.send(&Request::Shutdown).await.is_ok() {
            guest.close_stdin();
            if guest.wait_exit_code(KILL_GRACE).await.is_some() {
                guest.release();
                channel.outstanding = false;
                self.set_state(SessionState::Terminated);
                tracing::info!(session_id = %self.id, "session shut down");
                return;
            }
        }

        let exit = guest.terminate(KILL_GRACE).await;
        guest.release();
        channel.outstanding = false;
        self.set_state(SessionState::Terminated);
        tracing::info!(session_id = %self.id, exit = ?exit, "session terminated");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
