//! Links
//!
//! A [`Link`] is the state machine of one link endpoint. It lives inside its
//! session on the dispatch task and turns application commands and incoming
//! performatives into outgoing performatives. The application side of a link
//! is a [`Sender`] or a [`Receiver`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ferrox_amqp_types::{
    definitions::{
        self, DeliveryNumber, DeliveryTag, Handle, LinkError, ReceiverSettleMode, Role,
        SenderSettleMode, SequenceNo,
    },
    messaging::{Source, Target},
    performatives::{Attach, Detach, Transfer},
    states::LinkState,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{control::LinkId, Payload};

pub mod builder;
pub mod delivery;
mod error;
mod handle;
mod incomplete_transfer;
mod receiver;
mod sender;
pub(crate) mod state;

pub use builder::Builder;
pub use delivery::{Delivery, DeliveryFut, DeliveryOutcome, Sendable};
pub use error::*;
pub use receiver::Receiver;
pub use sender::Sender;

use delivery::PendingSend;
use incomplete_transfer::IncompleteTransfer;
use state::{LinkFlow, LinkFlowState};

/// Credit granted by receivers unless configured otherwise
pub const DEFAULT_CREDIT: u32 = 200;

/// How a receiver grants link credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// Credit is only granted by [`Receiver::set_credit`]
    Manual,

    /// The given credit is granted on attach and granted again once half of
    /// it has been used
    Auto(u32),
}

impl Default for CreditMode {
    fn default() -> Self {
        CreditMode::Auto(DEFAULT_CREDIT)
    }
}

/// Parameters of a locally initiated attach
#[derive(Debug, Clone)]
pub(crate) struct LinkConfig {
    pub name: String,
    pub role: Role,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub max_message_size: Option<u64>,
    pub initial_delivery_count: SequenceNo,
    pub credit_mode: CreditMode,
}

/// Events from the engine to a link handle
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Delivery(Delivery),
    Detached(Error),
}

/// What a link handle needs once its link is attached
#[derive(Debug)]
pub(crate) struct LinkRelay {
    pub id: LinkId,
    pub name: String,
    pub role: Role,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub remote_max_message_size: Option<u64>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// A link initiated by the peer, already attached
#[derive(Debug)]
pub enum IncomingLink {
    /// The peer attached as receiver, so this end sends
    Sender(Sender),

    /// The peer attached as sender, so this end receives
    Receiver(Receiver),
}

/// A delivery whose frames are being sent
#[derive(Debug)]
struct OutgoingDelivery {
    delivery_id: DeliveryNumber,
    settled: bool,
    first_frame: Option<Transfer>,
    payload: Payload,
    responder: oneshot::Sender<Result<DeliveryOutcome, SendError>>,
}

/// One Transfer frame ready to be emitted
#[derive(Debug)]
pub(crate) struct OutgoingTransfer {
    pub performative: Transfer,
    pub payload: Payload,
    /// Set on the last frame of a delivery that awaits a disposition
    pub unsettled: Option<DeliveryNumber>,
}

/// What a received Transfer frame produced
#[derive(Debug, Default)]
pub(crate) struct ReceivedTransfer {
    /// Delivery id of a completed delivery that awaits settlement
    pub unsettled: Option<DeliveryNumber>,
    /// Credit granted again in auto credit mode
    pub flow: Option<LinkFlow>,
}

/// The state machine of a link endpoint
#[derive(Debug)]
pub(crate) struct Link {
    pub id: LinkId,
    pub name: String,
    pub role: Role,
    pub state: LinkState,
    pub output_handle: Handle,
    pub input_handle: Option<Handle>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub max_message_size: Option<u64>,
    pub remote_max_message_size: Option<u64>,
    pub flow: LinkFlowState,
    pub credit_mode: CreditMode,

    pending: VecDeque<PendingSend>,
    in_flight: Option<OutgoingDelivery>,
    unsettled: BTreeMap<DeliveryNumber, oneshot::Sender<Result<DeliveryOutcome, SendError>>>,

    incomplete: Option<IncompleteTransfer>,
    unsettled_incoming: BTreeSet<DeliveryNumber>,

    events: mpsc::UnboundedSender<LinkEvent>,
    relay_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    attach_responder: Option<oneshot::Sender<Result<LinkRelay, AttachError>>>,
    detach_responder: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Link {
    fn new(
        id: LinkId,
        output_handle: Handle,
        name: String,
        role: Role,
        initial_delivery_count: SequenceNo,
        credit_mode: CreditMode,
    ) -> Self {
        let (events, relay_events) = mpsc::unbounded_channel();
        Self {
            id,
            name,
            role,
            state: LinkState::Detached,
            output_handle,
            input_handle: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            max_message_size: None,
            remote_max_message_size: None,
            flow: LinkFlowState::new(initial_delivery_count),
            credit_mode,
            pending: VecDeque::new(),
            in_flight: None,
            unsettled: BTreeMap::new(),
            incomplete: None,
            unsettled_incoming: BTreeSet::new(),
            events,
            relay_events: Some(relay_events),
            attach_responder: None,
            detach_responder: None,
        }
    }

    /// A link we are about to attach
    pub fn local(
        id: LinkId,
        output_handle: Handle,
        config: LinkConfig,
        responder: oneshot::Sender<Result<LinkRelay, AttachError>>,
    ) -> Self {
        let mut link = Self::new(
            id,
            output_handle,
            config.name,
            config.role,
            config.initial_delivery_count,
            config.credit_mode,
        );
        link.source = config.source;
        link.target = config.target;
        link.snd_settle_mode = config.snd_settle_mode;
        link.rcv_settle_mode = config.rcv_settle_mode;
        link.max_message_size = config.max_message_size;
        link.attach_responder = Some(responder);
        link
    }

    /// A link the peer attached, taking the opposite role
    pub fn remote(id: LinkId, output_handle: Handle, attach: Attach) -> Self {
        let role = attach.role.opposite();
        let mut link = Self::new(id, output_handle, attach.name, role, 0, CreditMode::default());
        link.state = LinkState::AttachReceived;
        link.input_handle = Some(attach.handle);
        link.snd_settle_mode = attach.snd_settle_mode;
        link.rcv_settle_mode = attach.rcv_settle_mode;
        link.source = attach.source.map(|s| *s);
        link.target = attach.target.map(|t| *t);
        link.remote_max_message_size = attach.max_message_size.filter(|size| *size > 0);
        if let Role::Receiver = role {
            let initial = attach.initial_delivery_count.unwrap_or(0);
            link.flow = LinkFlowState::new(initial);
        }
        link
    }

    fn attach_performative(&self) -> Attach {
        let initial_delivery_count = match self.role {
            Role::Sender => Some(self.flow.initial_delivery_count),
            Role::Receiver => None,
        };
        Attach {
            name: self.name.clone(),
            handle: self.output_handle,
            role: self.role,
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source.clone().map(Box::new),
            target: self.target.clone().map(Box::new),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size: self.max_message_size,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Produces our Attach, `None` if one is not due in the current state
    pub fn send_attach(&mut self) -> Option<Attach> {
        self.state = match self.state {
            LinkState::Detached => LinkState::AttachSent,
            LinkState::AttachReceived => LinkState::Attached,
            _ => return None,
        };
        Some(self.attach_performative())
    }

    /// Handles the peer's answer to our Attach
    ///
    /// An answer without the terminus we asked for means the peer refused
    /// the link and a Detach follows; the pending attach is resolved then.
    /// Returns the credit to grant right away in auto credit mode.
    pub fn on_incoming_attach(&mut self, attach: Attach) -> Option<LinkFlow> {
        self.state = LinkState::Attached;
        self.input_handle = Some(attach.handle);
        self.remote_max_message_size = attach.max_message_size.filter(|size| *size > 0);

        let refused = match self.role {
            Role::Sender => attach.target.is_none(),
            Role::Receiver => attach.source.is_none(),
        };

        if let Role::Receiver = self.role {
            let initial = attach.initial_delivery_count.unwrap_or(0);
            self.flow.initial_delivery_count = initial;
            self.flow.delivery_count = initial;
        }

        if refused {
            debug!(name = %self.name, "attach answered without terminus");
            return None;
        }

        if let Some(relay) = self.take_relay() {
            if let Some(responder) = self.attach_responder.take() {
                let _ = responder.send(Ok(relay));
            }
        }
        self.initial_credit()
    }

    /// Hands the event receiver to the application once attached
    pub fn take_relay(&mut self) -> Option<LinkRelay> {
        let events = self.relay_events.take()?;
        Some(LinkRelay {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            source: self.source.clone(),
            target: self.target.clone(),
            remote_max_message_size: self.remote_max_message_size,
            events,
        })
    }

    /// Credit granted when an auto credit receiver becomes attached
    pub fn initial_credit(&mut self) -> Option<LinkFlow> {
        match (self.role, self.credit_mode) {
            (Role::Receiver, CreditMode::Auto(credit)) if credit > 0 => {
                self.flow.link_credit = credit;
                Some(self.flow.as_link_flow(self.output_handle, false))
            }
            _ => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.state, LinkState::Attached)
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.state, LinkState::Detached)
    }

    /// Produces our Detach, `None` if one has been sent already
    pub fn send_detach(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Option<Detach> {
        self.state = match self.state {
            LinkState::AttachSent | LinkState::AttachReceived | LinkState::Attached => {
                LinkState::DetachSent
            }
            LinkState::DetachReceived => LinkState::Detached,
            LinkState::Detached | LinkState::DetachSent => return None,
        };
        Some(Detach {
            handle: self.output_handle,
            closed,
            error,
        })
    }

    /// The application asked to detach the link
    pub fn on_detach_requested(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
        responder: oneshot::Sender<Result<(), Error>>,
    ) -> Option<Detach> {
        self.cancel_sends(SendError::Detached(None));
        let detach = self.send_detach(closed, error);
        match self.state {
            LinkState::Detached => {
                let _ = responder.send(Ok(()));
            }
            _ => self.detach_responder = Some(responder),
        }
        detach
    }

    /// Handles the peer's Detach, returning our echo if one is due
    pub fn on_incoming_detach(&mut self, detach: Detach) -> Option<Detach> {
        let echo = match self.state {
            LinkState::DetachSent => {
                self.state = LinkState::Detached;
                None
            }
            _ => {
                self.state = LinkState::DetachReceived;
                self.send_detach(detach.closed, None)
            }
        };

        if let Some(responder) = self.attach_responder.take() {
            let _ = responder.send(Err(AttachError::Refused(detach.error)));
            return echo;
        }

        match self.detach_responder.take() {
            Some(responder) => {
                let result = match detach.error {
                    Some(error) => Err(Error::Detached(Some(error))),
                    None => Ok(()),
                };
                let _ = responder.send(result);
            }
            None => self.fail(Error::Detached(detach.error)),
        }
        echo
    }

    /// Tears the application side down
    ///
    /// Queued and unsettled sends fail, a pending attach or detach is
    /// answered and the handle receives the reason.
    pub fn fail(&mut self, err: Error) {
        self.cancel_sends(SendError::from(err.clone()));
        self.incomplete = None;
        if let Some(responder) = self.attach_responder.take() {
            let _ = responder.send(Err(AttachError::Link(err.clone())));
        }
        if let Some(responder) = self.detach_responder.take() {
            let _ = responder.send(Err(err.clone()));
        }
        let _ = self.events.send(LinkEvent::Detached(err));
    }

    /// Session or connection teardown, no Detach is exchanged
    pub fn on_teardown(&mut self, err: Error) {
        self.fail(err);
        self.state = LinkState::Detached;
    }

    fn cancel_sends(&mut self, err: SendError) {
        for pending in self.pending.drain(..) {
            let _ = pending.responder.send(Err(err.clone()));
        }
        if let Some(delivery) = self.in_flight.take() {
            let _ = delivery.responder.send(Err(err.clone()));
        }
        for (_, responder) in std::mem::take(&mut self.unsettled) {
            let _ = responder.send(Err(err.clone()));
        }
    }

    /* ------------------------------- sending ------------------------------ */

    /// Queues a message behind the ones already waiting for credit
    pub fn enqueue(&mut self, pending: PendingSend) {
        if !self.is_attached() || self.role != Role::Sender {
            let _ = pending.responder.send(Err(SendError::Detached(None)));
            return;
        }
        if let Some(max_message_size) = self.remote_max_message_size {
            let size = pending.sendable.len();
            if size as u64 > max_message_size {
                let _ = pending.responder.send(Err(SendError::MessageSizeExceeded {
                    size,
                    max_message_size,
                }));
                return;
            }
        }
        self.pending.push_back(pending);
    }

    /// Whether a frame is waiting to go out
    pub fn has_outgoing(&self) -> bool {
        self.is_attached()
            && (self.in_flight.is_some() || (!self.pending.is_empty() && self.flow.link_credit > 0))
    }

    /// Produces the next Transfer frame of this link
    ///
    /// A new delivery consumes one credit and takes the next session
    /// delivery id; continuation frames of the delivery in flight consume
    /// neither. Each frame carries as many payload bytes as `max_frame_size`
    /// leaves after the frame header and the performative.
    pub fn next_transfer(
        &mut self,
        next_delivery_id: &mut DeliveryNumber,
        max_frame_size: usize,
    ) -> Result<Option<OutgoingTransfer>, serde_amqp::Error> {
        if !self.is_attached() {
            return Ok(None);
        }

        if self.in_flight.is_none() {
            if self.flow.link_credit == 0 || self.pending.is_empty() {
                return Ok(None);
            }
            let Some(pending) = self.pending.pop_front() else {
                return Ok(None);
            };
            let Ok(delivery_count) = self.flow.consume(1) else {
                self.pending.push_front(pending);
                return Ok(None);
            };

            let delivery_id = *next_delivery_id;
            *next_delivery_id = next_delivery_id.wrapping_add(1);

            let PendingSend {
                sendable,
                responder,
            } = pending;
            let settled = match self.snd_settle_mode {
                SenderSettleMode::Settled => true,
                SenderSettleMode::Unsettled => false,
                SenderSettleMode::Mixed => sendable.settled.unwrap_or(false),
            };
            let delivery_tag = sendable
                .delivery_tag
                .unwrap_or_else(|| DeliveryTag::from(delivery_count.to_be_bytes().to_vec()));

            let first_frame = Transfer {
                handle: self.output_handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(delivery_tag),
                message_format: Some(sendable.message_format),
                settled: Some(settled),
                more: false,
                rcv_settle_mode: None,
                state: None,
                resume: false,
                aborted: false,
                batchable: false,
            };
            self.in_flight = Some(OutgoingDelivery {
                delivery_id,
                settled,
                first_frame: Some(first_frame),
                payload: sendable.payload,
                responder,
            });
        }

        let Some(delivery) = self.in_flight.as_mut() else {
            return Ok(None);
        };
        let mut performative = delivery.first_frame.take().unwrap_or_else(|| Transfer {
            handle: self.output_handle,
            delivery_id: None,
            delivery_tag: None,
            message_format: None,
            settled: None,
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        });

        // Measured with `more` set, which never encodes shorter
        performative.more = true;
        let overhead = crate::frames::FRAME_HEADER_SIZE + serde_amqp::to_vec(&performative)?.len();
        let capacity = max_frame_size.saturating_sub(overhead).max(1);

        if delivery.payload.len() > capacity {
            let payload = delivery.payload.split_to(capacity);
            return Ok(Some(OutgoingTransfer {
                performative,
                payload,
                unsettled: None,
            }));
        }

        performative.more = false;
        let Some(delivery) = self.in_flight.take() else {
            return Ok(None);
        };
        let unsettled = if delivery.settled {
            let _ = delivery.responder.send(Ok(DeliveryOutcome::Settled));
            None
        } else {
            self.unsettled
                .insert(delivery.delivery_id, delivery.responder);
            Some(delivery.delivery_id)
        };
        Ok(Some(OutgoingTransfer {
            performative,
            payload: delivery.payload,
            unsettled,
        }))
    }

    /// Resolves an unsettled delivery from the receiver's Disposition
    ///
    /// Returns whether the delivery reached a terminal state.
    pub fn on_disposition_as_sender(
        &mut self,
        delivery_id: DeliveryNumber,
        settled: bool,
        state: Option<&ferrox_amqp_types::messaging::DeliveryState>,
    ) -> bool {
        let Some(outcome) = DeliveryOutcome::from_disposition(settled, state.cloned()) else {
            return false;
        };
        match self.unsettled.remove(&delivery_id) {
            Some(responder) => {
                let _ = responder.send(Ok(outcome));
                true
            }
            None => false,
        }
    }

    /// Takes the receiver's flow state into account
    ///
    /// Returns the Flow to send back, for an echo or a finished drain.
    pub fn on_incoming_flow(&mut self, flow: &LinkFlow) -> Option<LinkFlow> {
        let echo = match self.role {
            Role::Sender => self.flow.on_incoming_flow_as_sender(flow),
            Role::Receiver => self.flow.on_incoming_flow_as_receiver(flow),
        };
        match echo {
            true => Some(self.flow.as_link_flow(self.output_handle, false)),
            false => None,
        }
    }

    /// Ends a drain once everything queued has been sent
    pub fn try_finish_drain(&mut self) -> Option<LinkFlow> {
        let idle = self.pending.is_empty() && self.in_flight.is_none();
        if self.role == Role::Sender && self.flow.drain && self.flow.link_credit > 0 && idle {
            self.flow.drain_credit();
            return Some(self.flow.as_link_flow(self.output_handle, false));
        }
        None
    }

    /* ------------------------------ receiving ----------------------------- */

    /// Delivery id of the partially received delivery, if any
    pub fn incomplete_delivery_id(&self) -> Option<DeliveryNumber> {
        self.incomplete.as_ref().map(|incomplete| incomplete.delivery_id)
    }

    /// Handles one Transfer frame for this receiver
    ///
    /// The first frame of a delivery consumes credit; continuation frames
    /// are buffered until the frame with `more = false`.
    pub fn on_incoming_transfer(
        &mut self,
        delivery_id: DeliveryNumber,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<ReceivedTransfer, definitions::Error> {
        let mut received = ReceivedTransfer::default();
        if !self.is_attached() {
            // Detach in progress, the frame is dropped
            return Ok(received);
        }
        if self.role != Role::Receiver {
            return Err(definitions::Error::new(
                definitions::AmqpError::NotAllowed,
                Some("Transfer received on a sending link".to_string()),
            ));
        }

        let (transfer, payload) = match self.incomplete.take() {
            None => {
                if self.flow.consume(1).is_err() {
                    return Err(definitions::Error::new(
                        LinkError::TransferLimitExceeded,
                        Some("Transfer received without link credit".to_string()),
                    ));
                }
                received.flow = self.refill_credit();

                if transfer.delivery_tag.is_none() {
                    return Err(definitions::Error::new(
                        definitions::AmqpError::InvalidField,
                        Some("First transfer of a delivery carries no delivery-tag".to_string()),
                    ));
                }
                if transfer.aborted {
                    return Ok(received);
                }
                if transfer.more {
                    self.check_message_size(payload.len())?;
                    self.incomplete = Some(IncompleteTransfer::new(delivery_id, transfer, payload));
                    return Ok(received);
                }
                (transfer, payload)
            }
            Some(mut incomplete) => {
                if transfer.aborted {
                    return Ok(received);
                }
                let more = transfer.more;
                incomplete.or_assign(transfer).map_err(|field| {
                    definitions::Error::new(
                        definitions::AmqpError::InvalidField,
                        Some(format!("Inconsistent {} across transfer frames", field.0)),
                    )
                })?;
                // Dropping `incomplete` on error discards what was buffered
                self.check_message_size(incomplete.buffer.len() + payload.len())?;
                incomplete.append(payload);
                if more {
                    self.incomplete = Some(incomplete);
                    return Ok(received);
                }
                incomplete.finish()
            }
        };

        self.check_message_size(payload.len())?;

        let settled = transfer.settled.unwrap_or(false);
        if !settled {
            self.unsettled_incoming.insert(delivery_id);
            received.unsettled = Some(delivery_id);
        }
        let delivery = Delivery {
            link: self.id,
            delivery_id,
            delivery_tag: transfer.delivery_tag.unwrap_or_default(),
            message_format: transfer.message_format.unwrap_or(0),
            settled,
            payload,
        };
        let _ = self.events.send(LinkEvent::Delivery(delivery));
        Ok(received)
    }

    /// Checks a delivery, or the part of it received so far, against our
    /// max-message-size
    fn check_message_size(&self, len: usize) -> Result<(), definitions::Error> {
        match self.max_message_size.filter(|size| *size > 0) {
            Some(max_message_size) if len as u64 > max_message_size => {
                Err(definitions::Error::new(
                    LinkError::MessageSizeExceeded,
                    Some(format!(
                        "Message of at least {} bytes received, limit is {}",
                        len, max_message_size
                    )),
                ))
            }
            _ => Ok(()),
        }
    }

    fn refill_credit(&mut self) -> Option<LinkFlow> {
        match self.credit_mode {
            CreditMode::Auto(credit) if !self.flow.drain && self.flow.link_credit <= credit / 2 => {
                self.flow.link_credit = credit;
                Some(self.flow.as_link_flow(self.output_handle, false))
            }
            _ => None,
        }
    }

    /// Grants credit as asked by the application, `None` keeps the current
    /// credit
    pub fn set_credit(&mut self, credit: Option<u32>, drain: bool) -> Option<LinkFlow> {
        if !self.is_attached() || self.role != Role::Receiver {
            return None;
        }
        if let Some(credit) = credit {
            self.flow.link_credit = credit;
        }
        self.flow.drain = drain;
        Some(self.flow.as_link_flow(self.output_handle, false))
    }

    /// Forgets an incoming delivery once we settled it, `false` if it was
    /// not awaiting settlement
    pub fn settle_incoming(&mut self, delivery_id: DeliveryNumber) -> bool {
        self.unsettled_incoming.remove(&delivery_id)
    }
}
