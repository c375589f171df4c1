//! Execution policy with builder pattern.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::sandbox::limits::ResourceLimits;

/// Modules that only compute and cannot reach the host.
const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "abc",
    "array",
    "base64",
    "bisect",
    "calendar",
    "cmath",
    "collections",
    "copy",
    "dataclasses",
    "datetime",
    "decimal",
    "enum",
    "fractions",
    "functools",
    "hashlib",
    "heapq",
    "itertools",
    "json",
    "math",
    "numbers",
    "operator",
    "pprint",
    "random",
    "re",
    "statistics",
    "string",
    "textwrap",
    "time",
    "typing",
    "unicodedata",
];

/// Modules that reach the host, the interpreter internals or native code.
const DEFAULT_DENIED_IMPORTS: &[&str] = &[
    "builtins",
    "ctypes",
    "gc",
    "importlib",
    "marshal",
    "multiprocessing",
    "os",
    "pickle",
    "pty",
    "resource",
    "shutil",
    "signal",
    "socket",
    "subprocess",
    "sys",
    "threading",
];

/// How the import guard interprets its module lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Only modules in the allow-set may be imported.
    Whitelist,
    /// Everything except the deny-set may be imported.
    Blacklist,
}

impl ImportMode {
    pub(crate) fn as_env(self) -> &'static str {
        match self {
            ImportMode::Whitelist => "whitelist",
            ImportMode::Blacklist => "blacklist",
        }
    }
}

/// What guest code may do with `open()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemMode {
    /// Every `open()` fails.
    Disabled,
    /// Read-only, and only below the sandbox root after resolving symlinks.
    ReadOnly,
    /// `open()` is left untouched.
    Unrestricted,
}

impl FilesystemMode {
    pub(crate) fn as_env(self) -> &'static str {
        match self {
            FilesystemMode::Disabled => "disabled",
            FilesystemMode::ReadOnly => "readonly",
            FilesystemMode::Unrestricted => "unrestricted",
        }
    }
}

/// Security and resource policy shared by every guest of a sandbox.
///
/// A policy is read-only once a run starts; the sandbox keeps it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Python interpreter executable, either a path or a name looked up on `PATH`.
    pub interpreter_path: PathBuf,
    /// Wall-clock budget for one execution (and for session startup).
    pub timeout: Duration,
    /// Maximum captured stdout in bytes.
    pub max_stdout_bytes: usize,
    /// Maximum captured stderr in bytes.
    pub max_stderr_bytes: usize,
    /// Import guard mode.
    pub import_mode: ImportMode,
    /// Module roots allowed in whitelist mode.
    pub allowed_imports: BTreeSet<String>,
    /// Module roots denied in blacklist mode.
    pub denied_imports: BTreeSet<String>,
    /// Reject module roots that start or end with `__`.
    pub block_dunder_imports: bool,
    /// Best-effort OS limits.
    pub limits: ResourceLimits,
    /// File-open posture.
    pub filesystem: FilesystemMode,
    /// Replace socket constructors with failing stubs.
    pub network_disabled: bool,
    /// Emit the repr of a trailing bare expression.
    pub print_last_expression: bool,
    /// Run the interpreter with `-I -S` (no site, no user paths, no `PYTHON*` vars).
    pub isolated: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            interpreter_path: PathBuf::from("python3"),
            timeout: Duration::from_secs(30),
            max_stdout_bytes: 1024 * 1024, // 1MB
            max_stderr_bytes: 1024 * 1024,
            import_mode: ImportMode::Whitelist,
            allowed_imports: DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            denied_imports: DEFAULT_DENIED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            block_dunder_imports: true,
            limits: ResourceLimits::default(),
            filesystem: FilesystemMode::Disabled,
            network_disabled: true,
            print_last_expression: true,
            isolated: true,
        }
    }
}

impl ExecutionPolicy {
    /// Create a new builder for ExecutionPolicy.
    pub fn builder() -> ExecutionPolicyBuilder {
        ExecutionPolicyBuilder::default()
    }

    /// Check the policy for values no guest could run under.
    pub fn validate(&self) -> Result<()> {
        if self.interpreter_path.as_os_str().is_empty() {
            return Err(SandboxError::Config("interpreter path is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::Config("timeout must be non-zero".to_string()));
        }
        if self.max_stdout_bytes == 0 || self.max_stderr_bytes == 0 {
            return Err(SandboxError::Config(
                "output caps must be greater than zero".to_string(),
            ));
        }
        let mut module_names = self.allowed_imports.iter().chain(&self.denied_imports);
        if let Some(bad) = module_names.find(|name| !is_module_root(name)) {
            return Err(SandboxError::Config(format!(
                "{bad:?} is not a top-level module name"
            )));
        }
        self.limits.validate()
    }
}

fn is_module_root(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for creating ExecutionPolicy instances.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPolicyBuilder {
    interpreter_path: Option<PathBuf>,
    timeout: Option<Duration>,
    max_stdout_bytes: Option<usize>,
    max_stderr_bytes: Option<usize>,
    import_mode: Option<ImportMode>,
    allowed_imports: Option<BTreeSet<String>>,
    denied_imports: Option<BTreeSet<String>>,
    block_dunder_imports: Option<bool>,
    limits: Option<ResourceLimits>,
    filesystem: Option<FilesystemMode>,
    network_disabled: Option<bool>,
    print_last_expression: Option<bool>,
    isolated: Option<bool>,
}

impl ExecutionPolicyBuilder {
    /// Set the path (or `PATH` name) of the Python interpreter.
    pub fn interpreter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter_path = Some(path.into());
        self
    }

    /// Set the wall-clock timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the stdout capture cap in bytes.
    pub fn max_stdout_bytes(mut self, bytes: usize) -> Self {
        self.max_stdout_bytes = Some(bytes);
        self
    }

    /// Set the stderr capture cap in bytes.
    pub fn max_stderr_bytes(mut self, bytes: usize) -> Self {
        self.max_stderr_bytes = Some(bytes);
        self
    }

    /// Only allow the given module roots.
    pub fn whitelist<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.import_mode = Some(ImportMode::Whitelist);
        self.allowed_imports = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    /// Allow everything except the given module roots.
    pub fn blacklist<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.import_mode = Some(ImportMode::Blacklist);
        self.denied_imports = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    /// Switch import mode while keeping the default lists.
    pub fn import_mode(mut self, mode: ImportMode) -> Self {
        self.import_mode = Some(mode);
        self
    }

    /// Toggle blocking of `__dunder__` module roots.
    pub fn block_dunder_imports(mut self, block: bool) -> Self {
        self.block_dunder_imports = Some(block);
        self
    }

    /// Set the resource limits.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Set the CPU-seconds limit only.
    pub fn cpu_seconds(mut self, seconds: u64) -> Self {
        let mut limits = self.limits.unwrap_or_default();
        limits.cpu_seconds = Some(seconds);
        self.limits = Some(limits);
        self
    }

    /// Set the address-space limit only.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        let mut limits = self.limits.unwrap_or_default();
        limits.address_space_bytes = Some(bytes);
        self.limits = Some(limits);
        self
    }

    /// Set the filesystem posture.
    pub fn filesystem(mut self, mode: FilesystemMode) -> Self {
        self.filesystem = Some(mode);
        self
    }

    /// Toggle socket interception.
    pub fn network_disabled(mut self, disabled: bool) -> Self {
        self.network_disabled = Some(disabled);
        self
    }

    /// Set the default for printing a trailing expression.
    pub fn print_last_expression(mut self, enabled: bool) -> Self {
        self.print_last_expression = Some(enabled);
        self
    }

    /// Toggle `-I -S` interpreter isolation.
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = Some(isolated);
        self
    }

    /// Build the ExecutionPolicy.
    pub fn build(self) -> ExecutionPolicy {
        let default = ExecutionPolicy::default();
        ExecutionPolicy {
            interpreter_path: self.interpreter_path.unwrap_or(default.interpreter_path),
            timeout: self.timeout.unwrap_or(default.timeout),
            max_stdout_bytes: self.max_stdout_bytes.unwrap_or(default.max_stdout_bytes),
            max_stderr_bytes: self.max_stderr_bytes.unwrap_or(default.max_stderr_bytes),
            import_mode: self.import_mode.unwrap_or(default.import_mode),
            allowed_imports: self.allowed_imports.unwrap_or(default.allowed_imports),
            denied_imports: self.denied_imports.unwrap_or(default.denied_imports),
            block_dunder_imports: self
                .block_dunder_imports
                .unwrap_or(default.block_dunder_imports),
            limits: self.limits.unwrap_or(default.limits),
            filesystem: self.filesystem.unwrap_or(default.filesystem),
            network_disabled: self.network_disabled.unwrap_or(default.network_disabled),
            print_last_expression: self
                .print_last_expression
                .unwrap_or(default.print_last_expression),
            isolated: self.isolated.unwrap_or(default.isolated),
        }
    }
}
