//! Messages exchanged between the broker and an execution worker.
//!
//! The logical protocol is a pair of `type`-tagged JSON sum types. Over a
//! process boundary every message travels inside an [`Envelope`] carrying the
//! call id, encoded as a length-prefixed frame.
//! Format: 4-byte length (u32 LE) + JSON body.

use std::fmt;
use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Toggles recognized on a run request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Skip the strict type-check phase.
    #[serde(default, rename = "noMyPy")]
    pub no_mypy: bool,
}

/// Request sent from the broker to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    /// Initialize the interpreter session if it isn't already.
    Load,

    /// Check and execute a snippet.
    Run {
        /// Guest source code.
        code: String,
        /// Run toggles; absent on the wire means defaults.
        #[serde(default)]
        options: RunOptions,
    },
}

/// Response sent from a worker to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    /// Outcome of a load request.
    LoadResponse {
        /// Whether the interpreter session is available.
        ok: bool,
    },

    /// Execution is about to begin. Never terminal.
    Started,

    /// Outcome of a run request.
    RunResponse(RunResponse),
}

impl Response {
    /// Whether this response settles the call it answers.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Started)
    }
}

/// Terminal outcome of a run request.
///
/// Exactly one of `result` and `error` is meaningful; build values with
/// [`RunResponse::success`] / [`RunResponse::failure`] and read them with
/// [`RunResponse::into_outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<GuestError>,
}

impl RunResponse {
    /// Successful run with the captured output.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            result: Some(output.into()),
            error: None,
        }
    }

    /// Failed check or run.
    pub fn failure(error: GuestError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&GuestError> {
        self.error.as_ref()
    }

    /// Collapse into a `Result`. An error wins over a result; a response
    /// carrying neither is an empty success.
    pub fn into_outcome(self) -> std::result::Result<String, GuestError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

/// Failure reported by a worker for a run request.
///
/// The variants keep diagnostics, guest exceptions and runtime
/// unavailability distinguishable for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum GuestError {
    /// Style violations, one diagnostic per line, prefixed with `Line `.
    Style(String),

    /// Strict type-check diagnostics, prefixed with `Line `.
    TypeCheck(String),

    /// The guest code raised.
    Exception(GuestException),

    /// The interpreter session could not be loaded.
    Unavailable(String),

    /// The request could not be decoded or the session misbehaved.
    Protocol(String),
}

impl GuestError {
    /// Whether this is a static-check diagnostic rather than a run outcome.
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, GuestError::Style(_) | GuestError::TypeCheck(_))
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestError::Style(diagnostic) | GuestError::TypeCheck(diagnostic) => {
                f.write_str(diagnostic)
            }
            GuestError::Exception(exception) => exception.fmt(f),
            GuestError::Unavailable(reason) => write!(f, "runtime unavailable: {}", reason),
            GuestError::Protocol(reason) => write!(f, "protocol error: {}", reason),
        }
    }
}

/// Structured representation of an exception raised by guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestException {
    /// Exception class name, e.g. `ZeroDivisionError`.
    #[serde(rename = "type")]
    pub kind: String,
    /// `str()` of the exception.
    pub message: String,
    /// Formatted traceback, when the interpreter provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// A message tagged with the call it belongs to.
///
/// Replies carry the id of the request they answer, which gives every call
/// its own logical reply channel over a shared pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: Uuid,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: Uuid, body: T) -> Self {
        Self { id, body }
    }
}

/// Write a message to a writer using length-prefixed JSON encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one raw frame body.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!(
                "Failed to read IPC message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(bytes))
}

/// Read and decode one message. End of stream is an error here.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let bytes = read_frame(reader)?
        .ok_or_else(|| Error::Ipc("IPC stream closed".to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}
