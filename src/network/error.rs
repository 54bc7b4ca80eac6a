use crate::backend::BackendError;
use std::io;
use thiserror::Error;

/// Errors raised while framing, decoding, relaying or dispatching messages.
///
/// Every variant except `Stopped` is fatal to the connection it occurred on and to
/// nothing else.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Version {found:#04x} not supported")]
    Version { found: u8 },

    #[error("Unknown message type: {0}")]
    UnknownMessage(u16),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Connection terminated by other side")]
    ConnectionTerminated,

    #[error("Unexpected {kind} message for {role} role")]
    UnexpectedMessage { role: &'static str, kind: &'static str },

    #[error("Frame field {field} too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Engine stopped")]
    Stopped,

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
