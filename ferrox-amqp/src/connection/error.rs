//! Implements errors associated with the connection

use std::io;

use ferrox_amqp_types::definitions::{self, AmqpError, ConnectionError, ErrorCondition};
use tokio::task::JoinError;

use crate::{
    frames,
    transport::{self, protocol_header::ProtocolHeader, sasl::SaslError, NegotiationError},
};

/// Errors that end an open [`Connection`](super::Connection)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// No frame was received within twice the peer's idle timeout, or our
    /// Close went unanswered for the open timeout
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// A frame exceeded the negotiated max-frame-size
    #[error("Frame size {size} exceeds the max-frame-size {max_frame_size}")]
    FramingError {
        /// Declared or encoded size of the frame
        size: usize,
        /// Negotiated limit for the direction
        max_frame_size: usize,
    },

    /// The frame header could not be trusted
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A frame body could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(#[source] serde_amqp::Error),

    /// A frame body could not be encoded
    #[error("Encode error: {0}")]
    EncodeError(#[source] serde_amqp::Error),

    /// We closed the connection because the peer violated the protocol
    #[error("Local error {:?}", .0)]
    Local(definitions::Error),

    /// The remote peer closed with the provided error
    #[error("Remote error {:?}", .0)]
    Remote(definitions::Error),

    /// The dispatch task panicked or was cancelled
    #[error(transparent)]
    JoinError(JoinError),

    /// The connection is not in a state that allows the operation
    #[error("Illegal connection state")]
    IllegalState,
}

impl Error {
    /// The condition sent in our Close when this error ends the connection
    pub(crate) fn to_close_error(&self) -> Option<definitions::Error> {
        let (condition, description): (ErrorCondition, String) = match self {
            Error::Io(_) | Error::Remote(_) | Error::JoinError(_) | Error::IllegalState => {
                return None
            }
            Error::Local(error) => return Some(error.clone()),
            Error::ConnectionTimeout => (
                AmqpError::ResourceLimitExceeded.into(),
                "No frame received within the idle timeout".to_string(),
            ),
            Error::FramingError { .. } | Error::MalformedFrame(_) => {
                (ConnectionError::FramingError.into(), self.to_string())
            }
            Error::DecodeError(_) => (AmqpError::DecodeError.into(), self.to_string()),
            Error::EncodeError(_) => (AmqpError::InternalError.into(), self.to_string()),
        };
        Some(definitions::Error::new(condition, Some(description)))
    }

    /// The condition handed to sessions and links torn down by this error
    pub(crate) fn to_teardown_error(&self) -> Option<definitions::Error> {
        match self {
            Error::Remote(error) => Some(error.clone()),
            error => error.to_close_error(),
        }
    }
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            frames::Error::MalformedFrame(reason) => Self::MalformedFrame(reason),
            frames::Error::FramingError {
                size,
                max_frame_size,
            } => Self::FramingError {
                size,
                max_frame_size,
            },
            frames::Error::DecodeError(err) => Self::DecodeError(err),
            frames::Error::EncodeError(err) => Self::EncodeError(err),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::Io(err),
            transport::Error::ConnectionTimeout => Self::ConnectionTimeout,
            transport::Error::Frame(err) => Self::from(err),
        }
    }
}

/// Error associated with opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The peer does not speak the protocol version we announced
    #[error("Protocol header mismatch, expected {expected:?}, found {found:x?}")]
    VersionMismatch {
        /// The header we announced
        expected: ProtocolHeader,
        /// The raw header the peer sent
        found: [u8; 8],
    },

    /// A max-frame-size below 512 was proposed
    #[error("Invalid max-frame-size {max_frame_size}, must be at least 512")]
    InvalidNegotiation {
        /// The offending proposal
        max_frame_size: u32,
    },

    /// The SASL pre-phase failed
    #[error(transparent)]
    Sasl(#[from] SaslError),

    /// Header or Open exchanged out of order
    #[error("Illegal connection state")]
    IllegalState,

    /// The peer did not complete the opening handshake in time
    #[error("Connection timed out while opening")]
    ConnectionTimeout,

    /// The peer closed the connection before it was open
    #[error("Remote closed the connection {:?}", .0)]
    RemoteClosed(Option<definitions::Error>),

    /// The connection failed while the Open was being exchanged
    #[error(transparent)]
    Connection(#[from] Error),
}

impl From<NegotiationError> for OpenError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Io(err) => Self::Io(err),
            NegotiationError::VersionMismatch { expected, found } => {
                Self::VersionMismatch { expected, found }
            }
            NegotiationError::IllegalState => Self::IllegalState,
        }
    }
}

impl From<transport::Error> for OpenError {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::Io(err),
            transport::Error::ConnectionTimeout => Self::ConnectionTimeout,
            err => Self::Connection(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use ferrox_amqp_types::definitions::{AmqpError, ConnectionError, ErrorCondition};

    use super::Error;
    use crate::{frames, transport};

    #[test]
    fn timeout_closes_with_resource_limit_exceeded() {
        let error = Error::from(transport::Error::ConnectionTimeout);
        assert!(matches!(error, Error::ConnectionTimeout));
        let close = error.to_close_error().unwrap();
        assert_eq!(
            close.condition,
            ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded)
        );
    }

    #[test]
    fn oversized_frame_closes_with_framing_error() {
        let error = Error::from(transport::Error::Frame(frames::Error::FramingError {
            size: 2048,
            max_frame_size: 1024,
        }));
        let close = error.to_close_error().unwrap();
        assert_eq!(
            close.condition,
            ErrorCondition::ConnectionError(ConnectionError::FramingError)
        );
    }

    #[test]
    fn io_errors_send_no_close() {
        let error = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(error.to_close_error().is_none());
    }
}
