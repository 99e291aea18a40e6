use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, Symbol, Uint as UInt, Ushort as UShort},
};

use crate::definitions::{Fields, Handle, TransferNumber};

/// Begin a session on a channel
///
/// <type name="begin" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:begin:list" code="0x00000000:0x00000011"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:begin:list",
    code = "0x0000_0000:0x0000_0011",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Begin {
    /// The remote channel for this session, set only when answering a remote Begin
    pub remote_channel: Option<UShort>,

    /// The transfer-id of the first transfer id the sender will send
    pub next_outgoing_id: TransferNumber,

    /// The initial incoming-window of the sender
    pub incoming_window: UInt,

    /// The initial outgoing-window of the sender
    pub outgoing_window: UInt,

    /// The maximum handle value that can be used on the session
    #[amqp_contract(default)]
    pub handle_max: Handle,

    /// The extension capabilities the sender supports
    pub offered_capabilities: Option<Array<Symbol>>,

    /// The extension capabilities the sender can use if the receiver supports them
    pub desired_capabilities: Option<Array<Symbol>>,

    /// Session properties
    pub properties: Option<Fields>,
}
