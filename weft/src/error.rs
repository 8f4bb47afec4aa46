use std::io;

use thiserror::Error;

use crate::parser::ParseError;

/// Central error type for the weft engine.
#[derive(Debug, Error)]
pub enum WeftError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed or reset the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client exceeded the idle timeout.
    #[error("client timed out")]
    TimedOut,

    /// Error while parsing an HTTP request.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Structured fail-with-code raised by handler code. Serialised as the
    /// indicated response at the top of the handler frame.
    #[error("{message}")]
    Handler { code: u16, message: String },

    /// Task slab reached its maximum capacity.
    #[error("task slab is full")]
    SlabFull,

    /// Startup failure (bind, worker spawn). Propagated to the caller of
    /// `Server::serve`; the process exits.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WeftError {
    /// Shorthand for the handler-level fail-with-code signal.
    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        WeftError::Handler {
            code,
            message: message.into(),
        }
    }

    /// Transport errors close the client without attempting a response.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WeftError::Io(_) | WeftError::ConnectionClosed | WeftError::TimedOut
        )
    }
}

pub type WeftResult<T> = Result<T, WeftError>;
