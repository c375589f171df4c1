//! Execution results and their assembly from guest frames.

use std::time::Duration;

use crate::error::{parse_python_exception, SandboxError};
use crate::sandbox::io::{CapturedText, TruncatingBuffer};
use crate::sandbox::process::StdoutLine;
use crate::sandbox::protocol::{classify, Frame, GuestLine};

/// Outcome of one execution. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code (0 for success).
    pub exit_code: i32,
    /// Captured program output, without protocol frames.
    pub stdout: String,
    /// Whether stdout hit the cap.
    pub stdout_truncated: bool,
    /// Captured stderr.
    pub stderr: String,
    /// Whether stderr hit the cap.
    pub stderr_truncated: bool,
    /// Wall-clock time of the call.
    pub elapsed: Duration,
    /// `repr()` of the printed last expression.
    pub last_value_repr: Option<String>,
    /// `ClassName: message` of the last exception.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Check if the execution was successful (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// The reported exception as a [`SandboxError::PythonException`].
    ///
    /// The traceback comes from stderr when the guest wrote one.
    pub fn exception(&self) -> Option<SandboxError> {
        let error = self.error.as_deref()?;
        let parsed = parse_python_exception(error);
        let traceback = match parse_python_exception(&self.stderr) {
            Some(SandboxError::PythonException { traceback, .. }) => traceback,
            _ => None,
        };
        match parsed {
            Some(SandboxError::PythonException {
                exception_type,
                message,
                ..
            }) => Some(SandboxError::PythonException {
                exception_type,
                message,
                traceback,
            }),
            _ => Some(SandboxError::PythonException {
                exception_type: error.split(':').next().unwrap_or(error).trim().to_string(),
                message: error
                    .split_once(':')
                    .map(|(_, m)| m.trim().to_string())
                    .unwrap_or_default(),
                traceback,
            }),
        }
    }
}

/// Accumulates stdout lines and frames for one request.
#[derive(Debug)]
pub(crate) struct FrameCollector {
    stdout: TruncatingBuffer,
    line_overflowed: bool,
    last_value: Option<String>,
    last_error: Option<String>,
    done_exit: Option<i32>,
    saw_error: bool,
}

impl FrameCollector {
    pub(crate) fn new(max_stdout_bytes: usize) -> Self {
        Self {
            stdout: TruncatingBuffer::new(max_stdout_bytes),
            line_overflowed: false,
            last_value: None,
            last_error: None,
            done_exit: None,
            saw_error: false,
        }
    }

    /// Feed one stdout line. Returns `true` on the `_done` frame.
    pub(crate) fn accept(&mut self, line: StdoutLine) -> bool {
        self.line_overflowed |= line.overflowed;
        match classify(&line.text) {
            GuestLine::Output(text) => {
                self.stdout.write_limited(text.as_bytes());
                self.stdout.write_limited(b"\n");
                false
            }
            GuestLine::Frame { leading, frame } => {
                if !leading.is_empty() {
                    self.stdout.write_limited(leading.as_bytes());
                }
                self.accept_frame(frame)
            }
        }
    }

    /// Keep only the raw output of a line belonging to an earlier request.
    ///
    /// Returns `true` on that request's `_done` frame.
    pub(crate) fn accept_stale(&mut self, line: StdoutLine) -> bool {
        self.line_overflowed |= line.overflowed;
        match classify(&line.text) {
            GuestLine::Output(text) => {
                self.stdout.write_limited(text.as_bytes());
                self.stdout.write_limited(b"\n");
                false
            }
            GuestLine::Frame { leading, frame } => {
                self.stdout.write_limited(leading.as_bytes());
                matches!(frame, Frame::Done { .. })
            }
        }
    }

    fn accept_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Value { repr } => self.last_value = Some(repr),
            Frame::Error { error } => {
                self.last_value = None;
                self.last_error = Some(error);
                self.saw_error = true;
            }
            Frame::Done { exit } => {
                self.done_exit = Some(exit);
                return true;
            }
            Frame::Meta { event } => tracing::debug!(%event, "guest meta event"),
        }
        false
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done_exit.is_some()
    }

    /// `_done` status, else the OS status, else 1 if an error was reported.
    pub(crate) fn resolve_exit(&self, os_exit: Option<i32>) -> i32 {
        self.done_exit
            .or(os_exit)
            .unwrap_or(if self.saw_error { 1 } else { 0 })
    }

    pub(crate) fn finish(
        self,
        exit_code: i32,
        stderr: CapturedText,
        max_stderr_bytes: usize,
        elapsed: Duration,
    ) -> ExecutionResult {
        let captured = self.stdout.take();
        let stdout_truncated = captured.truncated
            || self.line_overflowed
            || captured.text.len() >= self.stdout.max_bytes();
        let stderr_truncated = stderr.truncated || stderr.text.len() >= max_stderr_bytes;

        ExecutionResult {
            exit_code,
            stdout: captured.text,
            stdout_truncated,
            stderr: stderr.text,
            stderr_truncated,
            elapsed,
            last_value_repr: self.last_value,
            error: self.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> StdoutLine {
        StdoutLine {
            text: text.to_string(),
            overflowed: false,
        }
    }

    fn finish(collector: FrameCollector) -> ExecutionResult {
        let exit = collector.resolve_exit(None);
        collector.finish(exit, CapturedText::default(), 1024, Duration::from_millis(5))
    }

    #[test]
    fn test_output_and_value() {
        let mut collector = FrameCollector::new(1024);
        assert!(!collector.accept(line("hello")));
        assert!(!collector.accept(line(r#"[[PYEXEC]]{"type":"value","repr":"2"}"#)));
        assert!(collector.accept(line(r#"[[PYEXEC]]{"type":"_done","exit":0}"#)));

        let result = finish(collector);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.last_value_repr.as_deref(), Some("2"));
        assert!(result.is_success());
        assert!(!result.stdout_truncated);
    }

    #[test]
    fn test_error_clears_value() {
        let mut collector = FrameCollector::new(1024);
        collector.accept(line(r#"[[PYEXEC]]{"type":"value","repr":"1"}"#));
        collector.accept(line(r#"[[PYEXEC]]{"type":"error","error":"ValueError: bad"}"#));
        collector.accept(line(r#"[[PYEXEC]]{"type":"_done","exit":1}"#));

        let result = finish(collector);
        assert!(result.last_value_repr.is_none());
        assert_eq!(result.error.as_deref(), Some("ValueError: bad"));
        assert_eq!(result.exit_code, 1);

        let exc = result.exception().unwrap();
        match exc {
            SandboxError::PythonException { exception_type, .. } => {
                assert_eq!(exception_type, "ValueError")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_exit_priority() {
        let mut done = FrameCollector::new(64);
        done.accept(line(r#"[[PYEXEC]]{"type":"_done","exit":3}"#));
        assert_eq!(done.resolve_exit(Some(0)), 3);

        let mut errored = FrameCollector::new(64);
        errored.accept(line(r#"[[PYEXEC]]{"type":"error","error":"X: y"}"#));
        assert_eq!(errored.resolve_exit(Some(137)), 137);
        assert_eq!(errored.resolve_exit(None), 1);

        let quiet = FrameCollector::new(64);
        assert!(!quiet.is_done());
        assert_eq!(quiet.resolve_exit(None), 0);
    }

    #[test]
    fn test_stdout_truncation_flags() {
        let mut collector = FrameCollector::new(10);
        collector.accept(line("abcdefghijklmnop"));
        let result = finish(collector);
        assert!(result.stdout.len() <= 10);
        assert!(result.stdout_truncated);

        // A cut line flags truncation even when little was kept.
        let mut collector = FrameCollector::new(1024);
        collector.accept(StdoutLine {
            text: "x".to_string(),
            overflowed: true,
        });
        assert!(finish(collector).stdout_truncated);
    }

    #[test]
    fn test_stale_lines_keep_output_only() {
        let mut collector = FrameCollector::new(1024);
        assert!(!collector.accept_stale(line("late output")));
        assert!(!collector.accept_stale(line(r#"[[PYEXEC]]{"type":"error","error":"X: y"}"#)));
        assert!(collector.accept_stale(line(r#"[[PYEXEC]]{"type":"_done","exit":1}"#)));
        assert!(!collector.is_done());

        let result = finish(collector);
        assert_eq!(result.stdout, "late output\n");
        assert!(result.error.is_none());
        assert_eq!(result.exit_code, 0);
    }
}
