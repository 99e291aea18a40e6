use serde_amqp::macros::{DeserializeComposite, SerializeComposite};

use crate::{
    definitions::{DeliveryNumber, DeliveryTag, Handle, MessageFormat, ReceiverSettleMode},
    messaging::DeliveryState,
};

/// Transfer a message
///
/// The message payload follows the performative in the frame body.
///
/// <type name="transfer" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:transfer:list" code="0x00000000:0x00000014"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:transfer:list",
    code = "0x0000_0000:0x0000_0014",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Transfer {
    /// The link the transfer belongs to
    pub handle: Handle,

    /// Alias for delivery-tag, mandatory on the first frame of a delivery
    pub delivery_id: Option<DeliveryNumber>,

    /// Uniquely identifies the delivery attempt for a given message on this link
    pub delivery_tag: Option<DeliveryTag>,

    /// Indicates the message format
    pub message_format: Option<MessageFormat>,

    /// Whether the delivery is settled at the sender
    pub settled: Option<bool>,

    /// Indicates that the message has more content
    #[amqp_contract(default)]
    pub more: bool,

    /// Overrides the receiver settle mode of the link for this delivery
    pub rcv_settle_mode: Option<ReceiverSettleMode>,

    /// The state of the delivery at the sender
    pub state: Option<DeliveryState>,

    /// Indicates a resumed delivery
    #[amqp_contract(default)]
    pub resume: bool,

    /// Indicates that the message is aborted
    #[amqp_contract(default)]
    pub aborted: bool,

    /// Batchable hint
    #[amqp_contract(default)]
    pub batchable: bool,
}
