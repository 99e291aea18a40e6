//! Terminus addresses and delivery states
//!
//! Sources and targets are carried through the engine unexamined; only the
//! delivery states take part in settlement.

use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, OrderedMap, Symbol, Uint as UInt},
    value::Value,
};

use crate::definitions::{Fields, Seconds};

mod delivery_state;
pub use delivery_state::*;

/// Where messages of a link originate
///
/// <type name="source" class="composite" source="list" provides="source">
///     <descriptor name="amqp:source:list" code="0x00000000:0x00000028"/>
/// </type>
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:source:list",
    code = "0x0000_0000:0x0000_0028",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Source {
    /// The address of the source
    pub address: Option<String>,

    /// Indicates the durability of the terminus
    #[amqp_contract(default)]
    pub durable: UInt,

    /// The expiry policy of the source
    pub expiry_policy: Option<Symbol>,

    /// Duration that an expiring source will be retained
    #[amqp_contract(default)]
    pub timeout: Seconds,

    /// Request dynamic creation of a remote node
    #[amqp_contract(default)]
    pub dynamic: bool,

    /// Properties of the dynamically created node
    pub dynamic_node_properties: Option<Fields>,

    /// The distribution mode of the link
    pub distribution_mode: Option<Symbol>,

    /// A set of predicates to filter the messages admitted onto the link
    pub filter: Option<OrderedMap<Symbol, Value>>,

    /// Default outcome for unsettled transfers
    pub default_outcome: Option<Value>,

    /// Descriptors for the outcomes that can be chosen on this link
    pub outcomes: Option<Array<Symbol>>,

    /// The extension capabilities the sender supports/desires
    pub capabilities: Option<Array<Symbol>>,
}

impl Source {
    /// A source with only its address set
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

/// Where messages of a link are delivered to
///
/// <type name="target" class="composite" source="list" provides="target">
///     <descriptor name="amqp:target:list" code="0x00000000:0x00000029"/>
/// </type>
#[derive(Debug, Clone, Default, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:target:list",
    code = "0x0000_0000:0x0000_0029",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Target {
    /// The address of the target
    pub address: Option<String>,

    /// Indicates the durability of the terminus
    #[amqp_contract(default)]
    pub durable: UInt,

    /// The expiry policy of the target
    pub expiry_policy: Option<Symbol>,

    /// Duration that an expiring target will be retained
    #[amqp_contract(default)]
    pub timeout: Seconds,

    /// Request dynamic creation of a remote node
    #[amqp_contract(default)]
    pub dynamic: bool,

    /// Properties of the dynamically created node
    pub dynamic_node_properties: Option<Fields>,

    /// The extension capabilities the sender supports/desires
    pub capabilities: Option<Array<Symbol>>,
}

impl Target {
    /// A target with only its address set
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::{from_slice, to_vec};

    use super::*;

    #[test]
    fn terminus_address_passes_through() {
        let source = Source::with_address("queue/a");
        let buf = to_vec(&source).unwrap();
        let decoded: Source = from_slice(&buf).unwrap();
        assert_eq!(decoded.address.as_deref(), Some("queue/a"));

        let target = Target::with_address("queue/b");
        let buf = to_vec(&target).unwrap();
        let decoded: Target = from_slice(&buf).unwrap();
        assert_eq!(decoded, target);
    }
}
