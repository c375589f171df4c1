//! Public entry point tying policy, oneshot runner and session pool together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::ExecutionPolicy;
use crate::sandbox::limits::ensure_platform_supported;
use crate::sandbox::manager::{SessionManager, SessionManagerConfig};
use crate::sandbox::oneshot::OneshotRunner;
use crate::sandbox::options::{merge, ExecutionOptions};
use crate::sandbox::result::ExecutionResult;

/// A sandboxed Python execution environment.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct PythonSandbox {
    policy: Arc<ExecutionPolicy>,
    runner: OneshotRunner,
    sessions: SessionManager,
}

impl PythonSandbox {
    /// Create a sandbox with the default session pool.
    pub fn new(policy: ExecutionPolicy) -> Result<Self> {
        Self::with_sessions(policy, SessionManagerConfig::default())
    }

    /// Create a sandbox with an explicit session pool configuration.
    pub fn with_sessions(policy: ExecutionPolicy, sessions: SessionManagerConfig) -> Result<Self> {
        ensure_platform_supported()?;
        policy.validate()?;
        if sessions.max_sessions == 0 {
            return Err(SandboxError::Config("max_sessions must be at least 1".to_string()));
        }

        // The guest starts with an empty environment, so PATH lookup happens here.
        let interpreter = resolve_interpreter(&policy.interpreter_path)?;
        tracing::debug!(interpreter = %interpreter.display(), "resolved python interpreter");

        let policy = Arc::new(policy);
        Ok(Self {
            runner: OneshotRunner::new(interpreter.clone()),
            sessions: SessionManager::new(sessions, interpreter, Arc::clone(&policy)),
            policy,
        })
    }

    /// The policy every execution runs under.
    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// The session pool.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Execute `code` in a fresh interpreter that is discarded afterwards.
    pub async fn execute_once(
        &self,
        code: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let config = merge(&self.policy, options)?;
        self.runner.run(&config, code).await
    }

    /// Execute `code` in the persistent session `session_id`, creating it if needed.
    ///
    /// A session whose call times out is closed, so the next call with the
    /// same id starts from an empty namespace.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        // Rejected options never create a session.
        let config = merge(&self.policy, options)?;
        // The claim keeps the session out of eviction until the call is over.
        let session = self.sessions.checkout(session_id, &config.env).await?;

        match session.exec(&config, code).await {
            Err(e) if e.is_fatal_for_session() => {
                if e.is_timeout() {
                    tracing::warn!(session_id, "closing session after timeout");
                }
                self.sessions.discard(session.session()).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Shut down one session. Returns `false` if it did not exist.
    pub async fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close(session_id).await
    }

    /// Shut down every session.
    pub async fn close_all(&self) {
        self.sessions.close_all().await;
    }
}

fn resolve_interpreter(path: &Path) -> Result<PathBuf> {
    if path.components().count() > 1 {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(SandboxError::InterpreterNotFound(path.display().to_string()))
        };
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(path))
                .find(|candidate| is_executable(candidate))
        })
        .ok_or_else(|| SandboxError::InterpreterNotFound(path.display().to_string()))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interpreter() {
        let policy = ExecutionPolicy::builder()
            .interpreter_path("definitely-not-a-python-binary")
            .build();
        let err = PythonSandbox::new(policy).unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));

        let policy = ExecutionPolicy::builder()
            .interpreter_path("/nonexistent/bin/python3")
            .build();
        assert!(matches!(
            PythonSandbox::new(policy),
            Err(SandboxError::InterpreterNotFound(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SessionManagerConfig::builder().max_sessions(0).build();
        let err = PythonSandbox::with_sessions(ExecutionPolicy::default(), config).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_absolute_path() {
        let resolved = resolve_interpreter(Path::new("/bin/sh")).unwrap();
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }
}
