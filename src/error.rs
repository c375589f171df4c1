//! Error types for the Python sandbox.

use thiserror::Error;

/// Errors that can occur while driving guest interpreters.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The execution exceeded the configured wall-clock timeout.
    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The guest never reported readiness.
    #[error("guest interpreter failed to start: {0}")]
    StartupFailed(#[source] anyhow::Error),

    /// A caller-supplied argument was rejected before any process was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guest interpreter process could not be spawned.
    #[error("failed to spawn guest interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    /// I/O error on a guest pipe or the host filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The interpreter executable was not found.
    #[error("Python interpreter not found: {0}")]
    InterpreterNotFound(String),

    /// The session's guest process is gone.
    #[error("session {0} is terminated")]
    SessionTerminated(String),

    /// Every pooled session is busy and none can be evicted.
    #[error("session pool is full ({0} sessions, none evictable)")]
    CapacityExhausted(usize),

    /// The host platform cannot enforce the sandbox policy.
    #[error("unsupported platform: {0}")]
    Unsupported(String),

    /// A Python exception was raised during execution.
    #[error("Python {exception_type}: {message}")]
    PythonException {
        /// The type of Python exception (e.g., "ValueError", "TypeError").
        exception_type: String,
        /// The exception message.
        message: String,
        /// The traceback the guest wrote to stderr, if available.
        traceback: Option<String>,
    },
}

impl SandboxError {
    /// Create a Python exception error from stderr output.
    ///
    /// Attempts to parse the stderr to extract exception type, message, and traceback.
    pub fn from_python_stderr(stderr: &str) -> Option<Self> {
        parse_python_exception(stderr)
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error was raised by argument validation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, SandboxError::InvalidArgument(_))
    }

    /// Check if this error represents a Python exception.
    pub fn is_python_exception(&self) -> bool {
        matches!(self, SandboxError::PythonException { .. })
    }

    /// Check if this error means the guest process is no longer usable.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout(_)
                | SandboxError::StartupFailed(_)
                | SandboxError::Spawn(_)
                | SandboxError::Io(_)
                | SandboxError::SessionTerminated(_)
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Parse a Python exception from stderr output or an `error` frame.
///
/// Accepts both the one-line `ClassName: message` form the guest reports in
/// its frames and a full interpreter traceback.
pub fn parse_python_exception(stderr: &str) -> Option<SandboxError> {
    if stderr.trim().is_empty() {
        return None;
    }

    let lines: Vec<&str> = stderr.lines().collect();
    if lines.is_empty() {
        return None;
    }

    // Format: "ExceptionType: message" or "ExceptionType"
    let mut exception_line = None;
    let mut traceback_start = None;

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        }
        if !line.starts_with(' ')
            && !line.is_empty()
            && !line.starts_with("Traceback")
            && looks_like_exception(line)
        {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (exception_type, message) = match exception_str.find(':') {
        Some(colon_pos) => (
            exception_str[..colon_pos].trim().to_string(),
            exception_str[colon_pos + 1..].trim().to_string(),
        ),
        None => (exception_str.trim().to_string(), String::new()),
    };

    let traceback = traceback_start.map(|start| lines[start..=line_idx].join("\n"));

    Some(SandboxError::PythonException {
        exception_type,
        message,
        traceback,
    })
}

/// Check if a line looks like a Python exception.
fn looks_like_exception(line: &str) -> bool {
    let exception_suffixes = ["Error", "Exception", "Warning", "Exceeded"];
    let standalone_exceptions = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    let first_char = line.chars().next();
    if !first_char.map(|c| c.is_ascii_uppercase()).unwrap_or(false) {
        return false;
    }

    // The class name is everything up to the first colon.
    let name = line.split(':').next().unwrap_or(line).trim_end();
    if name.contains(' ') {
        return false;
    }

    exception_suffixes.iter().any(|suffix| name.ends_with(suffix))
        || standalone_exceptions.iter().any(|exc| name == *exc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_exception() {
        let stderr = "ValueError: invalid literal for int() with base 10: 'abc'";
        let result = parse_python_exception(stderr);

        if let Some(SandboxError::PythonException {
            exception_type,
            message,
            traceback,
        }) = result
        {
            assert_eq!(exception_type, "ValueError");
            assert_eq!(message, "invalid literal for int() with base 10: 'abc'");
            assert!(traceback.is_none());
        } else {
            panic!("Expected PythonException");
        }
    }

    #[test]
    fn test_parse_exception_with_traceback() {
        let stderr = r#"Traceback (most recent call last):
  File "<exec>", line 1, in <module>
ValueError: invalid value"#;

        let result = parse_python_exception(stderr);

        if let Some(SandboxError::PythonException {
            exception_type,
            message,
            traceback,
        }) = result
        {
            assert_eq!(exception_type, "ValueError");
            assert_eq!(message, "invalid value");
            assert!(traceback.unwrap().contains("Traceback"));
        } else {
            panic!("Expected PythonException");
        }
    }

    #[test]
    fn test_parse_exception_no_message() {
        let result = parse_python_exception("StopIteration");

        if let Some(SandboxError::PythonException {
            exception_type,
            message,
            ..
        }) = result
        {
            assert_eq!(exception_type, "StopIteration");
            assert!(message.is_empty());
        } else {
            panic!("Expected PythonException");
        }
    }

    #[test]
    fn test_parse_cpu_limit_exception() {
        let result = parse_python_exception("CpuTimeLimitExceeded: cell exceeded 1s of CPU time");
        assert!(matches!(
            result,
            Some(SandboxError::PythonException { ref exception_type, .. })
                if exception_type == "CpuTimeLimitExceeded"
        ));
    }

    #[test]
    fn test_plain_output_is_not_an_exception() {
        assert!(parse_python_exception("Hello: world and more").is_none());
        assert!(parse_python_exception("lowercase: text").is_none());
    }

    #[test]
    fn test_parse_empty_stderr() {
        assert!(parse_python_exception("").is_none());
        assert!(parse_python_exception("   ").is_none());
    }

    #[test]
    fn test_error_helpers() {
        let timeout = SandboxError::Timeout(std::time::Duration::from_secs(5));
        assert!(timeout.is_timeout());
        assert!(timeout.is_fatal_for_session());
        assert!(!timeout.is_python_exception());

        let invalid = SandboxError::InvalidArgument("cwd".to_string());
        assert!(invalid.is_invalid_argument());
        assert!(!invalid.is_fatal_for_session());

        let python_exc = SandboxError::PythonException {
            exception_type: "ValueError".to_string(),
            message: "test".to_string(),
            traceback: None,
        };
        assert!(python_exc.is_python_exception());
    }
}
