//! Wire-level errors shared by the client and the supervisor.

use thiserror::Error;

/// Errors raised while talking to the supervisor socket.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("daemon not running")]
    DaemonUnavailable,

    #[error("connection closed before a response arrived")]
    Truncated,
}
