//! Definitions shared by the transport performatives

use serde::{de, ser, Deserialize, Serialize};
use serde_amqp::{
    primitives::{OrderedMap, Symbol, Uint as UInt},
    value::Value,
};
use serde_bytes::ByteBuf;

mod error;
pub use error::*;

/// The IANA assigned port number for AMQP
pub const PORT: u16 = 5672;

/// The IANA assigned port number for secure AMQP (amqps)
pub const SECURE_PORT: u16 = 5671;

/// Major protocol version
pub const MAJOR: u8 = 1;

/// Minor protocol version
pub const MINOR: u8 = 0;

/// Protocol revision
pub const REVISION: u8 = 0;

/// The lower bound for the agreed maximum frame size (in bytes)
///
/// Both peers can always send frames of up to this size, even before a
/// definitive maximum frame size has been agreed.
pub const MIN_MAX_FRAME_SIZE: usize = 512;

/// The handle of a link, scoped to its session
///
/// The default value, used for `handle-max`, is `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub UInt);

impl Default for Handle {
    fn default() -> Self {
        Handle(u32::MAX)
    }
}

impl From<UInt> for Handle {
    fn from(value: UInt) -> Self {
        Self(value)
    }
}

impl From<Handle> for UInt {
    fn from(value: Handle) -> Self {
        value.0
    }
}

/// A duration measured in seconds
pub type Seconds = UInt;

/// A duration measured in milliseconds
pub type Milliseconds = UInt;

/// Opaque identifier of a delivery, unique among the unsettled deliveries of a link
pub type DeliveryTag = ByteBuf;

/// The session-scoped identifier of a delivery
pub type DeliveryNumber = SequenceNo;

/// The session-scoped identifier of a transfer frame
pub type TransferNumber = SequenceNo;

/// A 32-bit serial number that wraps around
pub type SequenceNo = UInt;

/// The format of a message payload
pub type MessageFormat = UInt;

/// A mapping from field name to value
pub type Fields = OrderedMap<Symbol, Value>;

/// Link endpoint role
///
/// Encoded as a boolean: `false` for sender and `true` for receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The endpoint sends messages
    Sender,
    /// The endpoint receives messages
    Receiver,
}

impl Role {
    /// The role the peer endpoint of a link takes
    pub fn opposite(&self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl From<Role> for bool {
    fn from(role: Role) -> Self {
        matches!(role, Role::Receiver)
    }
}

impl From<bool> for Role {
    fn from(value: bool) -> Self {
        if value {
            Role::Receiver
        } else {
            Role::Sender
        }
    }
}

impl ser::Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        bool::from(*self).serialize(serializer)
    }
}

impl<'de> de::Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        bool::deserialize(deserializer).map(Role::from)
    }
}

/// Settlement policy for a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SenderSettleMode {
    /// The sender will send all deliveries initially unsettled
    Unsettled,
    /// The sender will send all deliveries settled
    Settled,
    /// The sender may send a mixture of settled and unsettled deliveries
    #[default]
    Mixed,
}

/// Settlement policy for a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReceiverSettleMode {
    /// The receiver will spontaneously settle all incoming transfers
    #[default]
    First,
    /// The receiver will only settle after sending the disposition and
    /// receiving the sender's settlement
    Second,
}

impl From<SenderSettleMode> for u8 {
    fn from(mode: SenderSettleMode) -> Self {
        match mode {
            SenderSettleMode::Unsettled => 0,
            SenderSettleMode::Settled => 1,
            SenderSettleMode::Mixed => 2,
        }
    }
}

impl TryFrom<u8> for SenderSettleMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            _ => Err(value),
        }
    }
}

impl From<ReceiverSettleMode> for u8 {
    fn from(mode: ReceiverSettleMode) -> Self {
        match mode {
            ReceiverSettleMode::First => 0,
            ReceiverSettleMode::Second => 1,
        }
    }
}

impl TryFrom<u8> for ReceiverSettleMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            _ => Err(value),
        }
    }
}

macro_rules! ubyte_serde {
    ($($ty:ty),+) => {
        $(
            impl ser::Serialize for $ty {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    u8::from(*self).serialize(serializer)
                }
            }

            impl<'de> de::Deserialize<'de> for $ty {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    let value = u8::deserialize(deserializer)?;
                    <$ty>::try_from(value).map_err(|v| {
                        de::Error::custom(format!(
                            concat!("invalid value {} for ", stringify!($ty)),
                            v
                        ))
                    })
                }
            }
        )+
    };
}

ubyte_serde!(SenderSettleMode, ReceiverSettleMode);
