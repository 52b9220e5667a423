//! Error taxonomy shared by the engine, the dispatcher and the client.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    #[error("no answer after {attempts} attempts (last wait {waited:?})")]
    Timeout { attempts: u32, waited: Duration },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file I/O failed on {name}: {source}")]
    FileIo {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("file {name} is {size} bytes, more than the protocol can number")]
    FileTooLarge { name: String, size: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no session for peer {0}")]
    SessionNotFound(SocketAddr),

    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),

    #[error("cancelled by shutdown")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn file_io(name: impl Into<String>, source: std::io::Error) -> Error {
        Error::FileIo {
            name: name.into(),
            source,
        }
    }

    pub fn violation(msg: impl Into<String>) -> Error {
        Error::ProtocolViolation(msg.into())
    }

    /// Errors that cost one packet and leave the session running.
    pub fn is_packet_local(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_) | Error::ProtocolViolation(_) | Error::SessionNotFound(_)
        )
    }
}
