//! Guest prelude rendering.
//!
//! The guest side of the protocol is a Python script embedded as a template.
//! Rendering substitutes the frame marker and the stderr fence; the policy
//! itself reaches the guest through `PYEXEC_*` environment variables so the
//! script text stays stable.

use std::ffi::OsString;

use crate::sandbox::config::ExecutionPolicy;
use crate::sandbox::protocol::{FRAME_MARKER, STDERR_FENCE};

const TEMPLATE: &str = include_str!("guest_prelude.py");
const MARKER_PLACEHOLDER: &str = "__PYEXEC_MARKER__";
const FENCE_PLACEHOLDER: &str = "__PYEXEC_FENCE__";

/// Environment variable prefix owned by the sandbox.
pub const RESERVED_ENV_PREFIX: &str = "PYEXEC_";

/// Which lifecycle the guest serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMode {
    /// One request, then exit with its status.
    Oneshot,
    /// Request loop with a persistent namespace.
    Session,
}

/// Builds the script, arguments and environment of a guest interpreter.
#[derive(Debug, Clone, Copy)]
pub struct GuestPrelude<'a> {
    policy: &'a ExecutionPolicy,
    mode: GuestMode,
}

impl<'a> GuestPrelude<'a> {
    /// Prelude for `policy` in `mode`.
    pub fn new(policy: &'a ExecutionPolicy, mode: GuestMode) -> Self {
        Self { policy, mode }
    }

    /// The guest script text.
    pub fn render(&self) -> String {
        TEMPLATE
            .replace(MARKER_PLACEHOLDER, FRAME_MARKER)
            .replace(FENCE_PLACEHOLDER, STDERR_FENCE.trim_end())
    }

    /// Interpreter arguments, ending with the script.
    pub fn interpreter_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(5);
        if self.policy.isolated {
            args.push("-I".into());
            args.push("-S".into());
        }
        args.push("-u".into());
        args.push("-c".into());
        args.push(self.render().into());
        args
    }

    /// The complete guest environment; nothing is inherited from the host.
    pub fn environment(&self) -> Vec<(String, String)> {
        let flag = |b: bool| String::from(if b { "1" } else { "0" });
        let join = |set: &std::collections::BTreeSet<String>| {
            set.iter().cloned().collect::<Vec<_>>().join(",")
        };
        let policy = self.policy;

        let mut env = vec![
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            (
                "PYEXEC_SESSION".to_string(),
                flag(self.mode == GuestMode::Session),
            ),
            ("PYEXEC_NET_DISABLED".to_string(), flag(policy.network_disabled)),
            (
                "PYEXEC_FS_MODE".to_string(),
                policy.filesystem.as_env().to_string(),
            ),
            (
                "PYEXEC_IMPORT_MODE".to_string(),
                policy.import_mode.as_env().to_string(),
            ),
            ("PYEXEC_IMPORT_ALLOW".to_string(), join(&policy.allowed_imports)),
            ("PYEXEC_IMPORT_DENY".to_string(), join(&policy.denied_imports)),
            (
                "PYEXEC_BLOCK_DUNDER".to_string(),
                flag(policy.block_dunder_imports),
            ),
            (
                "PYEXEC_PRINT_LAST".to_string(),
                flag(policy.print_last_expression),
            ),
        ];
        env.extend(
            policy
                .limits
                .env_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::config::{FilesystemMode, ImportMode};

    fn lookup<'e>(env: &'e [(String, String)], key: &str) -> Option<&'e str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_render_substitutes_marker() {
        let policy = ExecutionPolicy::default();
        let script = GuestPrelude::new(&policy, GuestMode::Oneshot).render();
        assert!(script.contains(FRAME_MARKER));
        assert!(!script.contains(MARKER_PLACEHOLDER));
        assert!(script.contains(STDERR_FENCE.trim_end()));
        assert!(!script.contains(FENCE_PLACEHOLDER));
        assert!(script.contains("\"ready\""));
        assert!(script.contains("\"_done\""));
    }

    #[test]
    fn test_environment_reflects_policy() {
        let policy = ExecutionPolicy::builder()
            .blacklist(["socket", "ctypes"])
            .filesystem(FilesystemMode::ReadOnly)
            .network_disabled(false)
            .print_last_expression(false)
            .build();
        let env = GuestPrelude::new(&policy, GuestMode::Session).environment();

        assert_eq!(lookup(&env, "PYEXEC_SESSION"), Some("1"));
        assert_eq!(lookup(&env, "PYEXEC_NET_DISABLED"), Some("0"));
        assert_eq!(lookup(&env, "PYEXEC_FS_MODE"), Some("readonly"));
        assert_eq!(lookup(&env, "PYEXEC_IMPORT_MODE"), Some("blacklist"));
        assert_eq!(lookup(&env, "PYEXEC_IMPORT_DENY"), Some("ctypes,socket"));
        assert_eq!(lookup(&env, "PYEXEC_PRINT_LAST"), Some("0"));
        assert_eq!(lookup(&env, "PYEXEC_CPU_SECONDS"), Some("10"));
        assert_eq!(policy.import_mode, ImportMode::Blacklist);
    }

    #[test]
    fn test_isolation_flags() {
        let isolated = ExecutionPolicy::default();
        let args = GuestPrelude::new(&isolated, GuestMode::Oneshot).interpreter_args();
        assert_eq!(args[0], "-I");
        assert_eq!(args[1], "-S");
        assert_eq!(args[args.len() - 2], "-c");

        let open = ExecutionPolicy::builder().isolated(false).build();
        let args = GuestPrelude::new(&open, GuestMode::Oneshot).interpreter_args();
        assert_eq!(args[0], "-u");
    }
}
