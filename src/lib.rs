//! # Python Sandbox
//!
//! Policy-constrained execution of untrusted Python code in host interpreter
//! processes.
//!
//! Code runs either in a fresh, disposable interpreter per call
//! ([`PythonSandbox::execute_once`]) or in a long-lived interpreter bound to a
//! session id whose namespace persists between calls
//! ([`PythonSandbox::execute`]). Every execution is bounded by:
//!
//! - **Timeouts**: wall-clock deadline, process-group kill on expiry
//! - **Output caps**: stdout and stderr truncated at configurable sizes
//! - **Resource limits**: CPU time, address space and open files
//! - **Import policy**: whitelist or blacklist of top-level modules
//! - **Filesystem and network guards**: installed in the guest before user code runs
//!
//! ## Example
//!
//! ```rust,no_run
//! use pyexec_sandbox_rs::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let policy = ExecutionPolicy::builder()
//!         .timeout(Duration::from_secs(5))
//!         .max_memory(256 * 1024 * 1024)
//!         .build();
//!
//!     let sandbox = PythonSandbox::new(policy)?;
//!     let options = ExecutionOptions::new();
//!
//!     let result = sandbox.execute_once("print(1 + 1)", &options).await?;
//!     assert_eq!(result.stdout.trim(), "2");
//!
//!     sandbox.execute("s1", "x = 41", &options).await?;
//!     let result = sandbox.execute("s1", "x + 1", &options).await?;
//!     assert_eq!(result.last_value_repr.as_deref(), Some("42"));
//!
//!     sandbox.close_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! The guards are best-effort containment for cooperative workloads, layered as:
//!
//! 1. **Process isolation**: cleared environment, own process group, isolated interpreter flags
//! 2. **Kernel limits**: `setrlimit` for CPU, memory and file descriptors
//! 3. **In-interpreter guards**: import hook, `open` guard, socket stubs
//! 4. **Host supervision**: deadlines, output caps and forced termination
//!
//! They are not a security boundary against hostile code; run the host inside
//! an OS-level sandbox when that matters.

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{Result, SandboxError};
pub use sandbox::config::{ExecutionPolicy, ExecutionPolicyBuilder, FilesystemMode, ImportMode};
pub use sandbox::executor::PythonSandbox;
pub use sandbox::limits::ResourceLimits;
pub use sandbox::manager::{SessionManager, SessionManagerConfig, SessionManagerConfigBuilder};
pub use sandbox::options::ExecutionOptions;
pub use sandbox::result::ExecutionResult;
pub use sandbox::session::{DaemonSession, SessionClaim, SessionState};
