use crate::frames;

use super::protocol_header::ProtocolHeader;

/// Errors of an established transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Io error
    #[error(transparent)]
    Io(std::io::Error),

    /// Nothing was received within the idle deadline
    #[error("No frame received within the idle timeout")]
    ConnectionTimeout,

    /// Frame codec failure
    #[error(transparent)]
    Frame(frames::Error),
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            err => Self::Frame(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors of the protocol header exchange
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// Io error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer announced a protocol or version we do not speak
    #[error("Protocol header mismatch, expected {expected:?}, found {found:x?}")]
    VersionMismatch {
        /// The header we announced
        expected: ProtocolHeader,
        /// The raw header the peer sent
        found: [u8; 8],
    },

    /// The header exchange was attempted from the wrong connection state
    #[error("Illegal connection state for header exchange")]
    IllegalState,
}
