//! Frame level encoding and decoding
//!
//! ```text
//!              +0       +1       +2       +3
//!         +-----------------------------------+ -.
//!       0 |                SIZE               |  |
//!         +-----------------------------------+  |-- frame header
//!       4 |  DOFF  |  TYPE  | <TYPE-SPECIFIC> |  |   (8 bytes)
//!         +-----------------------------------+ -'
//!         |          EXTENDED HEADER          |
//!         +-----------------------------------+
//!         |            FRAME BODY             |
//!         +-----------------------------------+
//! ```

use ferrox_amqp_types::definitions::{self, AmqpError, ConnectionError};

pub mod amqp;

/// Frame type of AMQP frames
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Size of the fixed frame header in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Smallest legal data offset, in 4-byte words
pub const MIN_DOFF: u8 = 2;

/// Errors of the frame codec
///
/// Every variant is fatal to the connection since frame boundaries cannot
/// be trusted after a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Io error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame header is inconsistent
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The frame exceeds the negotiated max-frame-size
    #[error("Frame size {size} exceeds the max-frame-size {max_frame_size}")]
    FramingError {
        /// Declared or encoded size of the frame
        size: usize,
        /// Negotiated limit for the direction
        max_frame_size: usize,
    },

    /// The frame body could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(#[source] serde_amqp::Error),

    /// The frame body could not be encoded
    #[error("Encode error: {0}")]
    EncodeError(#[source] serde_amqp::Error),
}

impl Error {
    /// The error sent to the peer in the Close performative
    pub fn to_amqp_error(&self) -> Option<definitions::Error> {
        match self {
            Error::Io(_) => None,
            Error::MalformedFrame(reason) => Some(definitions::Error::new(
                ConnectionError::FramingError,
                Some(reason.to_string()),
            )),
            Error::FramingError { .. } => Some(definitions::Error::new(
                ConnectionError::FramingError,
                Some(self.to_string()),
            )),
            Error::DecodeError(err) => Some(definitions::Error::new(
                AmqpError::DecodeError,
                Some(err.to_string()),
            )),
            Error::EncodeError(err) => Some(definitions::Error::new(
                AmqpError::InternalError,
                Some(err.to_string()),
            )),
        }
    }
}
