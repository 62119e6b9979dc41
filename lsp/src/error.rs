//! Error taxonomy for the language-intelligence layer.
//!
//! Errors are `Clone` so one connection-creation outcome can be handed to
//! every caller that was waiting on it.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LspError {
    /// The server process could not be started.
    #[error("failed to start '{server}': {message}")]
    Spawn { server: String, message: String },
    /// Writing to or reading from a live server failed. Fatal to the connection.
    #[error("transport error on '{server}': {message}")]
    Transport { server: String, message: String },
    /// The server answered a request with an error payload.
    #[error("{method} failed ({code}): {message}")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },
    #[error("{method} timed out after {}ms", .elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },
    #[error("operation cancelled")]
    Cancelled,
    /// The server process exited or the connection was shut down.
    #[error("connection to '{server}' closed{}", format_stderr(.stderr.as_deref()))]
    ConnectionClosed {
        server: String,
        stderr: Option<String>,
    },
    #[error("handshake with '{server}' failed: {message}")]
    Handshake { server: String, message: String },
    #[error("{}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("cannot convert path to file URI: {}", .path.display())]
    InvalidUri { path: PathBuf },
    #[error("invalid glob pattern '{pattern}': {message}")]
    Glob { pattern: String, message: String },
    #[error("linter '{adapter}' failed: {message}")]
    Linter { adapter: String, message: String },
}

fn format_stderr(stderr: Option<&str>) -> String {
    match stderr.map(str::trim) {
        Some(text) if !text.is_empty() => format!("; stderr: {text}"),
        _ => String::new(),
    }
}

impl LspError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Whether the error came from the caller's own cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the error leaves the connection unusable.
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ConnectionClosed { .. } | Self::Handshake { .. }
        )
    }
}

pub type Result<T, E = LspError> = std::result::Result<T, E>;
