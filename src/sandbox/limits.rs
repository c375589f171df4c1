//! Resource limiting for guest interpreters.
//!
//! Limits are applied by the guest itself through `setrlimit` before it reports
//! readiness. They are best effort: the host wall-clock deadline remains the
//! authoritative bound on every execution.

use crate::error::{Result, SandboxError};

/// rlimit-style caps applied inside the guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU seconds per oneshot process, and per cell through the CPU alarm.
    pub cpu_seconds: Option<u64>,
    /// Maximum address space in bytes.
    pub address_space_bytes: Option<u64>,
    /// Maximum number of open file descriptors.
    pub open_files: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: Some(10),
            address_space_bytes: Some(512 * 1024 * 1024), // 512MB
            open_files: Some(64),
        }
    }
}

impl ResourceLimits {
    /// No limits at all; only the wall-clock timeout applies.
    pub fn unlimited() -> Self {
        Self {
            cpu_seconds: None,
            address_space_bytes: None,
            open_files: None,
        }
    }

    /// Reject limits that would make the guest unusable.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("cpu_seconds", self.cpu_seconds),
            ("address_space_bytes", self.address_space_bytes),
            ("open_files", self.open_files),
        ]
        .into_iter()
        .find(|(_, value)| *value == Some(0));

        match zero {
            Some((name, _)) => Err(SandboxError::Config(format!(
                "resource limit {name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }

    /// Environment variables carrying the limits into the guest. `0` means unset.
    pub(crate) fn env_pairs(&self) -> [(&'static str, String); 3] {
        let encode = |v: Option<u64>| v.unwrap_or(0).to_string();
        [
            ("PYEXEC_CPU_SECONDS", encode(self.cpu_seconds)),
            ("PYEXEC_MEM_BYTES", encode(self.address_space_bytes)),
            ("PYEXEC_NOFILE", encode(self.open_files)),
        ]
    }
}

/// Whether this host can enforce the guest policy (rlimits, signals, process groups).
pub fn platform_supported() -> bool {
    cfg!(unix)
}

/// Fail with [`SandboxError::Unsupported`] on hosts without POSIX process control.
pub fn ensure_platform_supported() -> Result<()> {
    if platform_supported() {
        Ok(())
    } else {
        Err(SandboxError::Unsupported(format!(
            "resource limits and process-group termination require a unix host, found {}",
            std::env::consts::OS
        )))
    }
}
