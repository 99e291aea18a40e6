use serde::{Deserialize, Serialize};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, Symbol, Uint as UInt, Ushort as UShort},
};

use crate::definitions::{Fields, Milliseconds};

/// Negotiate connection parameters
///
/// <type name="open" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:open:list" code="0x00000000:0x00000010"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:open:list",
    code = "0x0000_0000:0x0000_0010",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Open {
    /// The id of the source container
    pub container_id: String,

    /// The name of the target host
    pub hostname: Option<String>,

    /// Proposed maximum frame size
    #[amqp_contract(default)]
    pub max_frame_size: MaxFrameSize,

    /// The maximum channel number that can be used on the connection
    #[amqp_contract(default)]
    pub channel_max: ChannelMax,

    /// Idle time-out in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Locales available for outgoing text
    pub outgoing_locales: Option<Array<Symbol>>,

    /// Desired locales for incoming text in decreasing level of preference
    pub incoming_locales: Option<Array<Symbol>>,

    /// The extension capabilities the sender supports
    pub offered_capabilities: Option<Array<Symbol>>,

    /// The extension capabilities the sender can use if the receiver supports them
    pub desired_capabilities: Option<Array<Symbol>>,

    /// Connection properties
    pub properties: Option<Fields>,
}

/// Proposed maximum frame size, `u32::MAX` when absent from the wire
///
/// A peer MUST NOT send frames larger than its partner can handle, and a
/// peer that receives an oversized frame MUST close the connection with the
/// framing-error error-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxFrameSize(pub UInt);

impl Default for MaxFrameSize {
    fn default() -> Self {
        MaxFrameSize(u32::MAX)
    }
}

impl From<UInt> for MaxFrameSize {
    fn from(value: UInt) -> Self {
        Self(value)
    }
}

impl From<MaxFrameSize> for usize {
    fn from(value: MaxFrameSize) -> Self {
        value.0 as usize
    }
}

/// The highest channel number usable on the connection, `u16::MAX` when absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMax(pub UShort);

impl Default for ChannelMax {
    fn default() -> Self {
        Self(u16::MAX)
    }
}

impl From<UShort> for ChannelMax {
    fn from(value: UShort) -> Self {
        Self(value)
    }
}

impl From<ChannelMax> for UShort {
    fn from(value: ChannelMax) -> Self {
        value.0
    }
}
