//! Error types for the msgpack-rpc transport.

use thiserror::Error;

use crate::config::ConfigError;
use crate::rpc::RpcError;

/// Alias for `Result<T, nvim_rpc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport, correlation and client layers.
#[derive(Error, Debug)]
pub enum Error {
    /// `send` was called before `attach`, or after `stop`.
    #[error("not attached to a connection")]
    NotAttached,

    /// `attach` was called on a component that is already bound.
    #[error("already attached to a connection")]
    AlreadyAttached,

    /// The component was stopped and cannot be reused.
    #[error("stopped")]
    Stopped,

    /// A frame with an unknown tag or the wrong arity. Skipped by the read loop.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A well-tagged frame whose payload could not be decoded, or bytes that
    /// are not valid msgpack.
    #[error("codec error: {0}")]
    Codec(String),

    /// Reading from or writing to the connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered a request with an error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The connection ended before a response arrived.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No tokio runtime was available to spawn the background tasks on.
    #[error("no tokio runtime available")]
    NoRuntime,

    // Config errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Builds a [`Error::ConnectionClosed`] with the given reason.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Returns the peer-reported error, if this is one.
    pub fn as_rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }
}
