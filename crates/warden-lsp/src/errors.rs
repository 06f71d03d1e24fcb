//! Error types surfaced by protocol sessions.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::language::Language;
use crate::session::JsonRpcError;

/// Failures that prevent a session from being started.
///
/// Cloneable so that every caller waiting on one single-flight startup
/// receives the same error.
#[derive(Debug, Clone, Error)]
pub enum StartupError {
    /// The runtime artifact the descriptor launches is not on disk.
    #[error("runtime artifact for {descriptor} is missing: {detail}")]
    ArtifactMissing {
        /// Descriptor identifier.
        descriptor: String,
        /// What was looked for.
        detail: String,
    },

    /// The launch executable was not found.
    #[error("language server binary not found: {command}")]
    BinaryNotFound {
        /// The command that was not found.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Failed to spawn the language server process.
    #[error("failed to spawn language server process: {message}")]
    SpawnFailed {
        /// Description of the spawn failure.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The workspace root cannot be used as a working directory.
    #[error("workspace root {} is not a directory", path.display())]
    InvalidWorkspace {
        /// Path supplied by the caller.
        path: PathBuf,
    },

    /// The server answered `initialize` with an error or an unusable result.
    #[error("initialization handshake with the {language} server failed: {source}")]
    Handshake {
        /// Language of the failing server.
        language: Language,
        /// What went wrong during the exchange.
        #[source]
        source: SessionError,
    },
}

impl StartupError {
    /// Builds a spawn error, distinguishing a missing executable.
    pub(crate) fn from_spawn(command: &str, error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            Self::BinaryNotFound {
                command: command.to_owned(),
                source: Arc::new(error),
            }
        } else {
            Self::SpawnFailed {
                message: format!("failed to start {command}"),
                source: Arc::new(error),
            }
        }
    }

    /// Builds a spawn error for a pipe that could not be captured.
    pub(crate) fn missing_pipe(stream: &str) -> Self {
        Self::SpawnFailed {
            message: format!("failed to capture {stream}"),
            source: Arc::new(io::Error::other(format!("no {stream}"))),
        }
    }
}

/// Failures of an individual request against a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The handshake did not complete in time; the session is degraded.
    #[error("the {language} server did not complete its handshake in time")]
    HandshakeTimeout {
        /// Language of the degraded server.
        language: Language,
    },

    /// A message had an unexpected shape.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the malformed message.
        message: String,
    },

    /// No response arrived within the request timeout.
    #[error("request '{method}' timed out after {timeout:?}")]
    RequestTimeout {
        /// Method of the timed-out request.
        method: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The session has shut down or crashed past its restart budget.
    #[error("the {language} session has terminated")]
    SessionTerminated {
        /// Language of the terminated session.
        language: Language,
    },

    /// The request was cancelled before a response arrived.
    #[error("request {id} was cancelled")]
    Cancelled {
        /// Identifier of the cancelled request.
        id: i64,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server returned error: {message} (code: {code})")]
    Server {
        /// The JSON-RPC error code.
        code: i64,
        /// The error message from the server.
        message: String,
    },
}

impl SessionError {
    /// Creates a protocol error.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a server error from a JSON-RPC error object.
    #[must_use]
    pub fn from_jsonrpc(error: JsonRpcError) -> Self {
        Self::Server {
            code: error.code,
            message: error.message,
        }
    }

    /// Whether callers must treat this error as fatal for the request.
    ///
    /// Cancellation and server-side error objects are ordinary outcomes;
    /// everything else signals a session-level problem.
    #[must_use]
    pub const fn is_request_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::Protocol { .. }
                | Self::RequestTimeout { .. }
                | Self::SessionTerminated { .. }
        )
    }
}

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Missing Content-Length header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// Invalid header format.
    #[error("invalid header format")]
    InvalidHeader,
}
