use bytes::BytesMut;
use ferrox_amqp_types::{definitions::DeliveryNumber, performatives::Transfer};

use crate::Payload;

/// Raised when a continuation frame contradicts the frames before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InconsistentField(pub &'static str);

macro_rules! or_assign {
    ($self:ident, $other:ident, $field:ident) => {
        match &$self.performative.$field {
            Some(value) => {
                if let Some(other_value) = $other.$field {
                    if *value != other_value {
                        return Err(InconsistentField(stringify!($field)));
                    }
                }
            }
            None => {
                $self.performative.$field = $other.$field;
            }
        }
    };

    ($self:ident, $other:ident, $($field:ident),*) => {
        $(or_assign!($self, $other, $field);)*
    };
}

/// A delivery whose last frame has not arrived yet
///
/// Keyed by the delivery id of its first frame. Flushed on the frame with
/// `more = false`, dropped when the delivery is aborted or the link goes away.
#[derive(Debug)]
pub(crate) struct IncompleteTransfer {
    pub delivery_id: DeliveryNumber,
    pub performative: Transfer,
    pub buffer: BytesMut,
}

impl IncompleteTransfer {
    pub fn new(delivery_id: DeliveryNumber, transfer: Transfer, partial_payload: Payload) -> Self {
        let mut buffer = BytesMut::with_capacity(partial_payload.len());
        buffer.extend_from_slice(&partial_payload);
        Self {
            delivery_id,
            performative: transfer,
            buffer,
        }
    }

    /// Like `|=` but field by field
    ///
    /// Fields only carried by the first frame must agree when repeated. Once
    /// any frame marked the delivery settled, it stays settled.
    pub fn or_assign(&mut self, other: Transfer) -> Result<(), InconsistentField> {
        or_assign! {
            self, other,
            delivery_id,
            delivery_tag,
            message_format
        };

        match self.performative.settled {
            Some(true) => {}
            _ => {
                if other.settled.is_some() {
                    self.performative.settled = other.settled;
                }
            }
        }

        if let Some(other_state) = other.state {
            match &self.performative.state {
                Some(state) if state.is_terminal() => {}
                _ => self.performative.state = Some(other_state),
            }
        }

        self.performative.more = other.more;
        Ok(())
    }

    pub fn append(&mut self, other: Payload) {
        self.buffer.extend_from_slice(&other);
    }

    /// Takes the reassembled performative and payload
    pub fn finish(self) -> (Transfer, Payload) {
        (self.performative, self.buffer.freeze())
    }
}
