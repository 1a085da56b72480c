//! Jingle error types.
//!
//! Two layers of failure exist in this crate:
//!
//! - [`ProtocolError`] is what a peer gets back when one of its requests is
//!   refused (bad-request, out-of-order, tie-break, ...). It is a value that
//!   travels on the wire and never aborts the local state machine.
//! - [`JingleError`] covers local API misuse, configuration and I/O failures.
//!   Protocol errors are wrapped into it when they need to cross an API
//!   boundary that returns [`Result`].

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Local errors raised by the Jingle engine.
#[derive(Error, Debug)]
pub enum JingleError {
    /// A peer-visible protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation is not legal in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No factory is registered for the namespace.
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    /// A content with the same name and creator already exists.
    #[error("Duplicate content: {0}")]
    DuplicateContent(String),

    /// The session id is not known to the manager.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Async channel between a driver and its peer closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Jingle operations
pub type Result<T> = std::result::Result<T, JingleError>;

impl From<toml::de::Error> for JingleError {
    fn from(err: toml::de::Error) -> Self {
        JingleError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for JingleError {
    fn from(err: toml::ser::Error) -> Self {
        JingleError::Config(err.to_string())
    }
}
