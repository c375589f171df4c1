//! Sandbox module containing all execution-related components.

pub mod config;
pub mod executor;
pub mod guest;
pub mod io;
pub mod limits;
pub mod manager;
pub mod oneshot;
pub mod options;
pub mod process;
pub mod protocol;
pub mod result;
pub mod session;
