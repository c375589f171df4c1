//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    config::{ExecutionPolicy, FilesystemMode, ImportMode},
    executor::PythonSandbox,
    manager::SessionManagerConfig,
    options::ExecutionOptions,
    result::ExecutionResult,
};
