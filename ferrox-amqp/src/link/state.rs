//! Link flow state
//!
//! Both ends of a link keep a copy of delivery-count and link-credit. The
//! sender owns delivery-count, the receiver owns link-credit; each side
//! recomputes the value it does not own from the Flow frames it receives.

use ferrox_amqp_types::{
    definitions::{Fields, Handle, SequenceNo},
    performatives::Flow,
};

/// The link level fields of a Flow performative
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LinkFlow {
    pub handle: Handle,
    pub delivery_count: Option<SequenceNo>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Fields>,
}

impl TryFrom<Flow> for LinkFlow {
    type Error = Flow;

    fn try_from(flow: Flow) -> Result<Self, Self::Error> {
        match flow.handle {
            Some(handle) => Ok(LinkFlow {
                handle,
                delivery_count: flow.delivery_count,
                link_credit: flow.link_credit,
                available: flow.available,
                drain: flow.drain,
                echo: flow.echo,
                properties: flow.properties,
            }),
            None => Err(flow),
        }
    }
}

/// Returned when a transfer arrives without credit for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InsufficientCredit;

#[derive(Debug, Clone)]
pub(crate) struct LinkFlowState {
    pub initial_delivery_count: SequenceNo,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,
    pub properties: Option<Fields>,
}

impl LinkFlowState {
    pub fn new(initial_delivery_count: SequenceNo) -> Self {
        Self {
            initial_delivery_count,
            delivery_count: initial_delivery_count,
            link_credit: 0,
            available: 0,
            drain: false,
            properties: None,
        }
    }

    pub fn as_link_flow(&self, output_handle: Handle, echo: bool) -> LinkFlow {
        LinkFlow {
            handle: output_handle,
            delivery_count: Some(self.delivery_count),
            link_credit: Some(self.link_credit),
            available: Some(self.available),
            drain: self.drain,
            echo,
            properties: self.properties.clone(),
        }
    }

    /// Takes the receiver's view into account on the sending end
    ///
    /// `link-credit_snd := delivery-count_rcv + link-credit_rcv - delivery-count_snd`,
    /// where an unknown `delivery-count_rcv` is taken to be the initial
    /// delivery-count announced in our Attach. Returns whether the receiver
    /// asked for an echo.
    pub fn on_incoming_flow_as_sender(&mut self, flow: &LinkFlow) -> bool {
        let delivery_count_rcv = flow
            .delivery_count
            .unwrap_or(self.initial_delivery_count);

        if let Some(link_credit_rcv) = flow.link_credit {
            let limit = delivery_count_rcv.wrapping_add(link_credit_rcv);
            self.link_credit = serial_distance(self.delivery_count, limit);
        }
        self.drain = flow.drain;
        flow.echo
    }

    /// Takes the sender's view into account on the receiving end
    ///
    /// Only delivery-count and available are owned by the sender. When the
    /// sender moved delivery-count (after a drain), the unused part of our
    /// grant is gone, so the credit shrinks to what is left below the same
    /// delivery limit.
    pub fn on_incoming_flow_as_receiver(&mut self, flow: &LinkFlow) -> bool {
        if let Some(delivery_count) = flow.delivery_count {
            let limit = self.delivery_count.wrapping_add(self.link_credit);
            self.delivery_count = delivery_count;
            self.link_credit = serial_distance(delivery_count, limit);
        }
        if let Some(available) = flow.available {
            self.available = available;
        }
        flow.echo
    }

    /// Spends credit for `count` deliveries
    ///
    /// On the sending end this happens before the first frame of a delivery,
    /// on the receiving end when the first frame arrives. Returns the
    /// delivery-count before the deliveries, which senders use as the
    /// default delivery tag.
    pub fn consume(&mut self, count: u32) -> Result<SequenceNo, InsufficientCredit> {
        if self.link_credit < count {
            return Err(InsufficientCredit);
        }
        let current = self.delivery_count;
        self.delivery_count = self.delivery_count.wrapping_add(count);
        self.link_credit -= count;
        Ok(current)
    }

    /// Advances delivery-count over the unused credit, ending a drain
    pub fn drain_credit(&mut self) {
        self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
        self.link_credit = 0;
    }
}

/// `to - from` in RFC-1982 serial number arithmetic, floored at zero
pub(crate) fn serial_distance(from: SequenceNo, to: SequenceNo) -> u32 {
    let distance = to.wrapping_sub(from);
    if distance > i32::MAX as u32 {
        0
    } else {
        distance
    }
}
