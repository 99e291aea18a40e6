use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, OrderedMap, Symbol, Ulong as ULong},
};

use crate::{
    definitions::{
        DeliveryTag, Fields, Handle, ReceiverSettleMode, Role, SenderSettleMode, SequenceNo,
    },
    messaging::{DeliveryState, Source, Target},
};

/// Attach a link to a session
///
/// <type name="attach" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:attach:list" code="0x00000000:0x00000012"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:attach:list",
    code = "0x0000_0000:0x0000_0012",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Attach {
    /// The name of the link
    pub name: String,

    /// The handle for the link while attached
    pub handle: Handle,

    /// Role of the link endpoint
    pub role: Role,

    /// Settlement policy for the sender
    #[amqp_contract(default)]
    pub snd_settle_mode: SenderSettleMode,

    /// The settlement policy of the receiver
    #[amqp_contract(default)]
    pub rcv_settle_mode: ReceiverSettleMode,

    /// The source for messages
    pub source: Option<Box<Source>>,

    /// The target for messages
    pub target: Option<Box<Target>>,

    /// Unsettled delivery state
    pub unsettled: Option<OrderedMap<DeliveryTag, DeliveryState>>,

    /// The sender has partial delivery state for the unsettled map
    #[amqp_contract(default)]
    pub incomplete_unsettled: bool,

    /// Attach sender's initial delivery-count, mandatory for senders
    pub initial_delivery_count: Option<SequenceNo>,

    /// The maximum message size supported by the link endpoint
    pub max_message_size: Option<ULong>,

    /// The extension capabilities the sender supports
    pub offered_capabilities: Option<Array<Symbol>>,

    /// The extension capabilities the sender can use if the receiver supports them
    pub desired_capabilities: Option<Array<Symbol>>,

    /// Link properties
    pub properties: Option<Fields>,
}
