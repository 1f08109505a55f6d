//! Error types for pysnip-core.

use thiserror::Error;

/// Result type for pysnip-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pysnip-core.
///
/// These never cross the worker boundary as-is: the worker converts every
/// failure into a protocol response before replying.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IPC communication error with a worker.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The lock manifest is missing, unreadable or incomplete.
    #[error("lock manifest error: {0}")]
    Manifest(String),

    /// The interpreter session failed (not a guest exception).
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Recovery hint shown by the CLI next to the error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Manifest(_) => Some(
                "Point PYSNIP_LOCK_FILE (or --lock-file) at a lock manifest listing the \
                 support packages.",
            ),
            Error::Interpreter(_) => Some(
                "Set PYSNIP_PYTHON (or --python) to a Python 3 interpreter with pip available.",
            ),
            Error::Ipc(_) => Some(
                "Build the worker with `cargo build -p pysnip-worker` or set PYSNIP_WORKER_PATH.",
            ),
            _ => None,
        }
    }

    /// Render the error followed by its hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
