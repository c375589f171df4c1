//! Per-call execution options and their merge onto the policy.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::ExecutionPolicy;
use crate::sandbox::guest::RESERVED_ENV_PREFIX;

/// Per-call overrides layered on an [`ExecutionPolicy`].
///
/// Options can only narrow or select; they never widen what the policy allows.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Working directory relative to the sandbox root.
    pub cwd: Option<String>,
    /// Extra environment variables for the guest process.
    pub env: BTreeMap<String, String>,
    /// Override of the policy's print-last-expression default.
    pub print_last_expression: Option<bool>,
}

impl ExecutionOptions {
    /// Options that take every value from the policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run in a directory relative to the sandbox root.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the print-last-expression default.
    pub fn print_last_expression(mut self, enabled: bool) -> Self {
        self.print_last_expression = Some(enabled);
        self
    }
}

/// Effective configuration for one call.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// The sandbox policy, unchanged.
    pub policy: Arc<ExecutionPolicy>,
    /// Validated, normalized working directory relative to the root.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Whether a trailing bare expression is evaluated and reported.
    pub print_last_expression: bool,
}

impl EffectiveConfig {
    /// Resolve the working directory against `root`.
    ///
    /// When the directory exists it is canonicalized and must stay below the
    /// canonical root, so a symlink cannot lead a call outside its sandbox.
    pub fn resolve_cwd(&self, root: &Path) -> Result<PathBuf> {
        let canonical_root = root.canonicalize()?;
        let target = canonical_root.join(&self.cwd);
        if !target.exists() {
            return Ok(target);
        }

        let resolved = target.canonicalize()?;
        if !resolved.starts_with(&canonical_root) {
            return Err(SandboxError::InvalidArgument(format!(
                "working directory {} resolves outside the sandbox root",
                self.cwd.display()
            )));
        }
        Ok(resolved)
    }
}

/// Merge per-call options onto the policy.
pub fn merge(policy: &Arc<ExecutionPolicy>, options: &ExecutionOptions) -> Result<EffectiveConfig> {
    let cwd = match options.cwd.as_deref() {
        Some(raw) => validate_relative_dir(raw)?,
        None => PathBuf::new(),
    };

    for (key, value) in &options.env {
        validate_env_var(key, value)?;
    }

    Ok(EffectiveConfig {
        policy: Arc::clone(policy),
        cwd,
        env: options.env.clone(),
        print_last_expression: options
            .print_last_expression
            .unwrap_or(policy.print_last_expression),
    })
}

/// Validate a working directory lexically and normalize it.
///
/// Rejects absolute paths, `..`, and drive or UNC prefixes regardless of the
/// host platform. `""` and `"."` both mean the root.
pub fn validate_relative_dir(raw: &str) -> Result<PathBuf> {
    let reject = |reason: &str| {
        Err(SandboxError::InvalidArgument(format!(
            "working directory {raw:?} {reason}"
        )))
    };

    if raw.contains('\0') {
        return reject("contains a NUL byte");
    }
    if raw.starts_with("\\\\") || raw.starts_with("//") {
        return reject("is a UNC path");
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return reject("has a drive prefix");
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return reject("is absolute");
    }

    let mut normalized = PathBuf::new();
    for part in raw.split(['/', '\\']) {
        if part == ".." {
            return reject("escapes the sandbox root");
        }
        if part.is_empty() || part == "." {
            continue;
        }
        normalized.push(part);
    }

    // Second opinion from the platform's own parser.
    if normalized
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return reject("is not a plain relative path");
    }
    Ok(normalized)
}

fn validate_env_var(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.contains(['=', '\0']) || value.contains('\0') {
        return Err(SandboxError::InvalidArgument(format!(
            "invalid environment variable {key:?}"
        )));
    }
    if key.starts_with(RESERVED_ENV_PREFIX) {
        return Err(SandboxError::InvalidArgument(format!(
            "environment variable {key} uses the reserved {RESERVED_ENV_PREFIX} prefix"
        )));
    }
    Ok(())
}
