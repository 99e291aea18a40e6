//! The nine transport performatives and the [`Performative`] union over them

mod attach;
mod begin;
mod close;
mod detach;
mod disposition;
mod end;
mod flow;
mod open;
mod transfer;

pub use attach::*;
pub use begin::*;
pub use close::*;
pub use detach::*;
pub use disposition::*;
pub use end::*;
pub use flow::*;
pub use open::*;
pub use transfer::*;

described_union! {
    /// Any performative that can be carried in the body of an AMQP frame
    #[derive(Debug, Clone, PartialEq)]
    pub enum Performative {
        /// Negotiate connection parameters
        Open(Open) = ("amqp:open:list", 0x10),
        /// Begin a session on a channel
        Begin(Begin) = ("amqp:begin:list", 0x11),
        /// Attach a link to a session
        Attach(Attach) = ("amqp:attach:list", 0x12),
        /// Update link state
        Flow(Flow) = ("amqp:flow:list", 0x13),
        /// Transfer a message
        Transfer(Transfer) = ("amqp:transfer:list", 0x14),
        /// Inform remote peer of delivery state changes
        Disposition(Disposition) = ("amqp:disposition:list", 0x15),
        /// Detach the link endpoint from the session
        Detach(Detach) = ("amqp:detach:list", 0x16),
        /// End the session
        End(End) = ("amqp:end:list", 0x17),
        /// Signal a connection close
        Close(Close) = ("amqp:close:list", 0x18),
    }
}

impl Performative {
    /// The symbolic name of the performative, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }
}
