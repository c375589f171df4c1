//! Line protocol spoken with the guest prelude.
//!
//! Host → guest: one JSON request per line on stdin.
//! Guest → host: stdout lines; a line carrying [`FRAME_MARKER`] holds a JSON
//! frame, anything else is program output. Session guests also close every
//! request's stderr with [`STDERR_FENCE`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix marking a protocol frame on the guest's stdout.
pub const FRAME_MARKER: &str = "[[PYEXEC]]";

/// Line a session guest writes to stderr right before each `_done` frame.
pub const STDERR_FENCE: &str = "[[PYEXEC-END]]\n";

/// Request sent to the guest.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request<'a> {
    /// Execute a code cell.
    Exec {
        /// Guest source text.
        code: &'a str,
        /// Per-call options.
        opt: RequestOptions,
    },
    /// Leave the request loop.
    Shutdown,
}

/// Options carried by an exec request.
#[derive(Debug, Serialize)]
pub struct RequestOptions {
    /// Absolute directory to change into before running the cell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Whether to evaluate and report a trailing bare expression.
    #[serde(rename = "printLastExpression")]
    pub print_last_expression: bool,
}

impl Request<'_> {
    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Frame emitted by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Lifecycle event; `ready` is sent once before the request loop.
    #[serde(rename = "_meta")]
    Meta {
        /// Event name.
        event: String,
    },
    /// Representation of the printed last expression.
    #[serde(rename = "value")]
    Value {
        /// `repr()` of the value.
        repr: String,
    },
    /// An exception, as `ClassName: message`.
    #[serde(rename = "error")]
    Error {
        /// One-line description.
        error: String,
    },
    /// End of the frame sequence for one request.
    #[serde(rename = "_done")]
    Done {
        /// Exit status of the request.
        exit: i32,
    },
}

impl Frame {
    /// Whether this is the startup readiness frame.
    pub fn is_ready(&self) -> bool {
        matches!(self, Frame::Meta { event } if event == "ready")
    }
}

/// A marker-prefixed line that did not decode.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The JSON after the marker is malformed or of an unknown shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One stdout line after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestLine {
    /// Program output.
    Output(String),
    /// A frame, with any program output that preceded it on the same line.
    Frame {
        /// Output written without a trailing newline before the frame.
        leading: String,
        /// The decoded frame.
        frame: Frame,
    },
}

/// Decode the frame part of a line, if it has one.
pub fn parse_frame(line: &str) -> Option<Result<(usize, Frame), FrameError>> {
    let start = line.find(FRAME_MARKER)?;
    let payload = &line[start + FRAME_MARKER.len()..];
    Some(
        serde_json::from_str::<Frame>(payload.trim_end())
            .map(|frame| (start, frame))
            .map_err(FrameError::from),
    )
}

/// Classify a stdout line. Malformed frames are recovered as output.
pub fn classify(line: &str) -> GuestLine {
    match parse_frame(line) {
        None => GuestLine::Output(line.to_string()),
        Some(Ok((start, frame))) => GuestLine::Frame {
            leading: line[..start].to_string(),
            frame,
        },
        Some(Err(e)) => {
            tracing::debug!(error = %e, "treating malformed frame as output");
            GuestLine::Output(line.to_string())
        }
    }
}
