use serde_amqp::macros::{DeserializeComposite, SerializeComposite};

use crate::{
    definitions::{DeliveryNumber, Role},
    messaging::DeliveryState,
};

/// Inform remote peer of delivery state changes
///
/// <type name="disposition" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:disposition:list" code="0x00000000:0x00000015"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:disposition:list",
    code = "0x0000_0000:0x0000_0015",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Disposition {
    /// Directionality of disposition
    pub role: Role,

    /// Lower bound of deliveries
    pub first: DeliveryNumber,

    /// Upper bound of deliveries, equal to `first` when absent
    pub last: Option<DeliveryNumber>,

    /// Indicates deliveries are settled
    #[amqp_contract(default)]
    pub settled: bool,

    /// Indicates state of deliveries
    pub state: Option<DeliveryState>,

    /// Batchable hint
    #[amqp_contract(default)]
    pub batchable: bool,
}
