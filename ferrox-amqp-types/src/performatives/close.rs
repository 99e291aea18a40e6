use serde_amqp::macros::{DeserializeComposite, SerializeComposite};

use crate::definitions::Error;

/// Signal a connection close
///
/// <type name="close" class="composite" source="list" provides="frame">
///     <descriptor name="amqp:close:list" code="0x00000000:0x00000018"/>
/// </type>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:close:list",
    code = "0x0000_0000:0x0000_0018",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Close {
    /// Error causing the close
    pub error: Option<Error>,
}
