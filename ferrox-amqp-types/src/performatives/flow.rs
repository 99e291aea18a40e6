use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::Uint as UInt,
};

use crate::definitions::{Fields, Handle, SequenceNo, TransferNumber};

/// Update link state
///
/// Without a handle the frame only updates session flow state.
///
/// <type name="flow" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:flow:list" code="0x00000000:0x00000013"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:flow:list",
    code = "0x0000_0000:0x0000_0013",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Flow {
    /// The expected transfer-id of the next incoming transfer
    pub next_incoming_id: Option<TransferNumber>,

    /// The incoming window of the sender of this frame
    pub incoming_window: UInt,

    /// The transfer-id that will be assigned to the next outgoing transfer
    pub next_outgoing_id: TransferNumber,

    /// The outgoing window of the sender of this frame
    pub outgoing_window: UInt,

    /// The link the flow state applies to
    pub handle: Option<Handle>,

    /// The endpoint's delivery-count
    pub delivery_count: Option<SequenceNo>,

    /// The current maximum number of messages that can be received
    pub link_credit: Option<UInt>,

    /// The number of available messages
    pub available: Option<UInt>,

    /// Indicates drain mode
    #[amqp_contract(default)]
    pub drain: bool,

    /// Request state from partner
    #[amqp_contract(default)]
    pub echo: bool,

    /// Link state properties
    pub properties: Option<Fields>,
}
