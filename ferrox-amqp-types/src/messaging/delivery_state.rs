use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Uint as UInt, Ulong as ULong},
};

use crate::definitions::{Error, Fields};

/// The last received section of a partially delivered message
///
/// <type name="received" class="composite" source="list" provides="delivery-state">
///     <descriptor name="amqp:received:list" code="0x00000000:0x00000023"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:received:list",
    code = "0x0000_0000:0x0000_0023",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Received {
    /// Section number within the message
    pub section_number: UInt,
    /// Offset within the section
    pub section_offset: ULong,
}

/// The accepted outcome
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:accepted:list",
    code = "0x0000_0000:0x0000_0024",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Accepted {}

/// The rejected outcome
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:rejected:list",
    code = "0x0000_0000:0x0000_0025",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Rejected {
    /// The error that caused the message to be rejected
    pub error: Option<Error>,
}

/// The released outcome
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:released:list",
    code = "0x0000_0000:0x0000_0026",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Released {}

/// The modified outcome
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:modified:list",
    code = "0x0000_0000:0x0000_0027",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Modified {
    /// Count the transfer as an unsuccessful delivery attempt
    pub delivery_failed: Option<bool>,

    /// Prevent redelivery
    pub undeliverable_here: Option<bool>,

    /// Message attributes to combine with the existing message-annotations
    pub message_annotations: Option<Fields>,
}

described_union! {
    /// The state of a delivery at an endpoint
    #[derive(Debug, Clone, PartialEq)]
    pub enum DeliveryState {
        /// Partial progress of a delivery
        Received(Received) = ("amqp:received:list", 0x23),
        /// Terminal: the message was accepted
        Accepted(Accepted) = ("amqp:accepted:list", 0x24),
        /// Terminal: the message was rejected
        Rejected(Rejected) = ("amqp:rejected:list", 0x25),
        /// Terminal: the message was released
        Released(Released) = ("amqp:released:list", 0x26),
        /// Terminal: the message was modified
        Modified(Modified) = ("amqp:modified:list", 0x27),
    }
}

impl DeliveryState {
    /// Whether the state is an outcome, ie. a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Received(_))
    }
}

/// A terminal delivery state
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The message was accepted
    Accepted(Accepted),
    /// The message was rejected
    Rejected(Rejected),
    /// The message was released
    Released(Released),
    /// The message was modified
    Modified(Modified),
}

impl From<Outcome> for DeliveryState {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Accepted(v) => DeliveryState::Accepted(v),
            Outcome::Rejected(v) => DeliveryState::Rejected(v),
            Outcome::Released(v) => DeliveryState::Released(v),
            Outcome::Modified(v) => DeliveryState::Modified(v),
        }
    }
}

impl TryFrom<DeliveryState> for Outcome {
    type Error = DeliveryState;

    fn try_from(value: DeliveryState) -> Result<Self, Self::Error> {
        match value {
            DeliveryState::Accepted(v) => Ok(Outcome::Accepted(v)),
            DeliveryState::Rejected(v) => Ok(Outcome::Rejected(v)),
            DeliveryState::Released(v) => Ok(Outcome::Released(v)),
            DeliveryState::Modified(v) => Ok(Outcome::Modified(v)),
            state @ DeliveryState::Received(_) => Err(state),
        }
    }
}
