//! Error types for watchd-client.

use thiserror::Error;

use crate::pdu::{map_get, Value};

/// Main error type for all client operations.
///
/// Errors are `Clone` because a single transport or protocol failure is
/// fanned out to every command still waiting on a response.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Socket path resolution or transport connect failed, or the
    /// connection could not be negotiated.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer violated the protocol: malformed PDU, a response with no
    /// queued command, or a unilateral event with no subscriber installed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read or write failure on the socket, including end of stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller misused the API: non-map handshake arguments, or `run()`
    /// without a transport or on a broken connection.
    #[error("{0}")]
    Usage(String),

    /// `close()` was called while work was outstanding.
    #[error("connection closed by caller")]
    Closed,

    /// The server answered with a value carrying an `"error"` key.
    /// The full response is preserved for inspection.
    #[error("server error: {}", response_error_text(.0))]
    Response(Value),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Render the `"error"` detail of a server response for display.
fn response_error_text(value: &Value) -> String {
    match map_get(value, "error") {
        Some(Value::String(s)) => s.as_str().unwrap_or("<non-utf8>").to_owned(),
        Some(other) => other.to_string(),
        None => "<missing error detail>".to_owned(),
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
