use serde_amqp::macros::{DeserializeComposite, SerializeComposite};

use crate::definitions::{Error, Handle};

/// Detach the link endpoint from the session
///
/// <type name="detach" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:detach:list" code="0x00000000:0x00000016"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:detach:list",
    code = "0x0000_0000:0x0000_0016",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Detach {
    /// The local handle of the link to be detached
    pub handle: Handle,

    /// If true then the sender has closed the link
    #[amqp_contract(default)]
    pub closed: bool,

    /// Error causing the detach
    pub error: Option<Error>,
}
