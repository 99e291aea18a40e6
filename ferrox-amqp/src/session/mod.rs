//! Sessions
//!
//! A [`Session`] is the state machine of one session endpoint. It owns the
//! links attached on it, keeps the session flow control windows and the
//! delivery id sequence, and turns what it receives and what its links want
//! to send into outgoing frames. The application side is a
//! [`SessionHandle`].

use std::collections::BTreeMap;

use ferrox_amqp_types::{
    definitions::{
        self, AmqpError, ConnectionError, DeliveryNumber, Handle, Role, SessionError,
        TransferNumber,
    },
    messaging::DeliveryState,
    performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
    states::{LinkState, SessionState},
};
use slab::Slab;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::{
    connection::{ConnectionHandle, Outbox},
    control::{LinkId, SessionId},
    error::ScopedError,
    frames::amqp::{Frame, FrameBody},
    link::{
        self, delivery::PendingSend, state::LinkFlow, AttachError, Link, LinkConfig, LinkRelay,
        OutgoingTransfer, SendError,
    },
    Payload,
};

mod builder;
mod error;
mod handle;

pub use builder::Builder;
pub use error::{BeginError, Error};
pub use handle::SessionHandle;

/// Default incoming and outgoing window
pub const DEFAULT_WINDOW: u32 = 2048;

/// Default handle-max
pub const DEFAULT_HANDLE_MAX: u32 = 255;

/// Local parameters of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionConfig {
    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: DEFAULT_HANDLE_MAX,
        }
    }
}

/// Events from the engine to a session handle
#[derive(Debug)]
pub(crate) enum SessionEvent {
    IncomingLink(LinkRelay),
    Ended(Result<(), Error>),
}

/// What a session handle needs once its session is mapped
#[derive(Debug)]
pub(crate) struct SessionRelay {
    pub id: SessionId,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// The state machine of a session endpoint
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) outgoing_channel: u16,
    pub(crate) incoming_channel: Option<u16>,
    max_frame_size: usize,
    config: SessionConfig,

    // session flow control
    initial_outgoing_id: TransferNumber,
    next_outgoing_id: TransferNumber,
    incoming_window: u32,
    outgoing_window: u32,
    next_incoming_id: TransferNumber,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
    remote_handle_max: u32,

    // deliveries
    next_outgoing_delivery_id: DeliveryNumber,
    next_incoming_delivery_id: Option<DeliveryNumber>,
    outgoing_unsettled: BTreeMap<DeliveryNumber, usize>,
    incoming_unsettled: BTreeMap<DeliveryNumber, usize>,

    links: Slab<Link>,
    link_serial: u64,
    input_handles: BTreeMap<Handle, usize>,

    events: mpsc::UnboundedSender<SessionEvent>,
    relay_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    begin_responder: Option<oneshot::Sender<Result<SessionRelay, BeginError>>>,
    end_responder: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Session {
    /// Creates a builder for a session
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Begins a session with the default configuration
    pub async fn begin(connection: &mut ConnectionHandle) -> Result<SessionHandle, BeginError> {
        Builder::new().begin(connection).await
    }

    pub(crate) fn new(
        id: SessionId,
        outgoing_channel: u16,
        config: SessionConfig,
        max_frame_size: usize,
    ) -> Self {
        let (events, relay_events) = mpsc::unbounded_channel();
        Self {
            id,
            state: SessionState::Unmapped,
            outgoing_channel,
            incoming_channel: None,
            max_frame_size,
            config,
            initial_outgoing_id: config.next_outgoing_id,
            next_outgoing_id: config.next_outgoing_id,
            incoming_window: config.incoming_window,
            outgoing_window: config.outgoing_window,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            remote_handle_max: u32::MAX,
            next_outgoing_delivery_id: 0,
            next_incoming_delivery_id: None,
            outgoing_unsettled: BTreeMap::new(),
            incoming_unsettled: BTreeMap::new(),
            links: Slab::new(),
            link_serial: 0,
            input_handles: BTreeMap::new(),
            events,
            relay_events: Some(relay_events),
            begin_responder: None,
            end_responder: None,
        }
    }

    pub(crate) fn set_begin_responder(
        &mut self,
        responder: oneshot::Sender<Result<SessionRelay, BeginError>>,
    ) {
        self.begin_responder = Some(responder);
    }

    pub(crate) fn take_relay(&mut self) -> Option<SessionRelay> {
        let events = self.relay_events.take()?;
        Some(SessionRelay {
            id: self.id,
            events,
        })
    }

    pub(crate) fn is_unmapped(&self) -> bool {
        matches!(self.state, SessionState::Unmapped)
    }

    fn push(&self, body: FrameBody, out: &mut Outbox) {
        out.push_back(Frame::new(self.outgoing_channel, body));
    }

    /* ------------------------------ begin/end ----------------------------- */

    pub(crate) fn send_begin(&mut self, out: &mut Outbox) -> Result<(), ScopedError> {
        self.state = match self.state {
            SessionState::Unmapped => SessionState::BeginSent,
            SessionState::BeginReceived => SessionState::Mapped,
            _ => return Err(ScopedError::illegal_state("Begin already sent")),
        };
        let begin = Begin {
            remote_channel: self.incoming_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: Handle(self.config.handle_max),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.push(FrameBody::Begin(begin), out);
        self.on_mapped();
        Ok(())
    }

    pub(crate) fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> Result<(), ScopedError> {
        self.state = match self.state {
            SessionState::BeginSent => SessionState::Mapped,
            SessionState::Unmapped => SessionState::BeginReceived,
            _ => return Err(ScopedError::illegal_state("Unexpected Begin")),
        };
        self.incoming_channel = Some(channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
        self.remote_handle_max = begin.handle_max.0;
        self.on_mapped();
        Ok(())
    }

    fn on_mapped(&mut self) {
        if let SessionState::Mapped = self.state {
            if let Some(responder) = self.begin_responder.take() {
                if let Some(relay) = self.take_relay() {
                    let _ = responder.send(Ok(relay));
                }
            }
        }
    }

    fn send_end(&mut self, error: Option<definitions::Error>, out: &mut Outbox) {
        self.state = match self.state {
            SessionState::EndReceived => SessionState::Unmapped,
            SessionState::Mapped | SessionState::BeginSent if error.is_some() => {
                SessionState::Discarding
            }
            SessionState::Mapped | SessionState::BeginSent => SessionState::EndSent,
            _ => return,
        };
        self.push(FrameBody::End(End { error }), out);
    }

    /// The application asked to end the session
    pub(crate) fn on_end_requested(
        &mut self,
        error: Option<definitions::Error>,
        responder: oneshot::Sender<Result<(), Error>>,
        out: &mut Outbox,
    ) {
        self.tear_down_links(link::Error::SessionClosed(error.clone()));
        self.send_end(error, out);
        match self.state {
            SessionState::Unmapped => {
                let _ = responder.send(Ok(()));
            }
            _ => self.end_responder = Some(responder),
        }
    }

    pub(crate) fn on_incoming_end(&mut self, end: End, out: &mut Outbox) -> Result<(), ScopedError> {
        match self.state {
            SessionState::Mapped | SessionState::BeginSent => {
                self.state = SessionState::EndReceived;
                debug!(channel = self.outgoing_channel, error = ?end.error, "session ended by remote");
                self.tear_down_links(link::Error::SessionClosed(end.error.clone()));
                if let Some(responder) = self.begin_responder.take() {
                    let _ = responder.send(Err(BeginError::RemoteEnded(end.error.clone())));
                }
                self.send_end(None, out);
                let result = match end.error {
                    Some(error) => Err(Error::RemoteError(error)),
                    None => Ok(()),
                };
                let _ = self.events.send(SessionEvent::Ended(result));
            }
            SessionState::EndSent | SessionState::Discarding => {
                self.state = SessionState::Unmapped;
                let result = match end.error {
                    Some(error) => Err(Error::RemoteError(error)),
                    None => Ok(()),
                };
                if let Some(responder) = self.end_responder.take() {
                    let _ = responder.send(result.clone());
                }
                let _ = self.events.send(SessionEvent::Ended(result));
            }
            _ => return Err(ScopedError::illegal_state("Unexpected End")),
        }
        Ok(())
    }

    /// Ends the session because of a violation the peer committed
    pub(crate) fn fail(&mut self, error: definitions::Error, out: &mut Outbox) {
        error!(channel = self.outgoing_channel, ?error, "ending session");
        self.tear_down_links(link::Error::SessionClosed(Some(error.clone())));
        self.send_end(Some(error.clone()), out);
        if let Some(responder) = self.end_responder.take() {
            let _ = responder.send(Err(Error::LocalError(error.clone())));
        }
        let _ = self.events.send(SessionEvent::Ended(Err(Error::LocalError(error))));
    }

    /// Connection teardown, no End is exchanged
    pub(crate) fn on_teardown(&mut self, error: Option<definitions::Error>) {
        self.tear_down_links(link::Error::ConnectionClosed(error.clone()));
        if let Some(responder) = self.begin_responder.take() {
            let _ = responder.send(Err(BeginError::ConnectionClosed(error.clone())));
        }
        if let Some(responder) = self.end_responder.take() {
            let _ = responder.send(Err(Error::ConnectionClosed(error.clone())));
        }
        if !self.is_unmapped() {
            let _ = self
                .events
                .send(SessionEvent::Ended(Err(Error::ConnectionClosed(error))));
        }
        self.state = SessionState::Unmapped;
    }

    fn tear_down_links(&mut self, err: link::Error) {
        for (_, link) in self.links.iter_mut() {
            link.on_teardown(err.clone());
        }
        self.links.clear();
        self.input_handles.clear();
        self.outgoing_unsettled.clear();
        self.incoming_unsettled.clear();
    }

    /* -------------------------------- links ------------------------------- */

    fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links
            .get_mut(id.key)
            .filter(|link| link.id.serial == id.serial)
    }

    fn link_by_input_handle(&self, handle: Handle) -> Result<usize, ScopedError> {
        self.input_handles.get(&handle).copied().ok_or_else(|| {
            ScopedError::session(SessionError::UnattachedHandle, "No link attached on the handle")
        })
    }

    fn remove_link(&mut self, key: usize) {
        if self.links.contains(key) {
            self.links.remove(key);
        }
        self.input_handles.retain(|_, k| *k != key);
        self.outgoing_unsettled.retain(|_, k| *k != key);
        self.incoming_unsettled.retain(|_, k| *k != key);
    }

    fn push_link_flow(&self, link_flow: LinkFlow, out: &mut Outbox) {
        let flow = self.flow(Some(link_flow));
        self.push(FrameBody::Flow(flow), out);
    }

    fn flow(&self, link_flow: Option<LinkFlow>) -> Flow {
        let mut flow = Flow {
            next_incoming_id: self.incoming_channel.map(|_| self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            handle: None,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        if let Some(link_flow) = link_flow {
            flow.handle = Some(link_flow.handle);
            flow.delivery_count = link_flow.delivery_count;
            flow.link_credit = link_flow.link_credit;
            flow.available = link_flow.available;
            flow.drain = link_flow.drain;
            flow.echo = link_flow.echo;
            flow.properties = link_flow.properties;
        }
        flow
    }

    fn handle_max(&self) -> u32 {
        self.config.handle_max.min(self.remote_handle_max)
    }

    /// The application asked to attach a link
    pub(crate) fn attach_link(
        &mut self,
        config: LinkConfig,
        responder: oneshot::Sender<Result<LinkRelay, AttachError>>,
        out: &mut Outbox,
    ) {
        if !matches!(self.state, SessionState::Mapped) {
            let _ = responder.send(Err(AttachError::IllegalSessionState));
            return;
        }
        let duplicated = self
            .links
            .iter()
            .any(|(_, link)| link.name == config.name && link.role == config.role);
        if duplicated {
            let _ = responder.send(Err(AttachError::DuplicatedLinkName(config.name)));
            return;
        }

        let key = self.links.vacant_key();
        if key as u64 > self.handle_max() as u64 {
            let _ = responder.send(Err(AttachError::HandleMaxReached));
            return;
        }

        self.link_serial += 1;
        let id = LinkId {
            session: self.id,
            key,
            serial: self.link_serial,
        };
        let mut link = Link::local(id, Handle(key as u32), config, responder);
        if let Some(attach) = link.send_attach() {
            self.push(FrameBody::Attach(attach), out);
        }
        self.links.insert(link);
    }

    fn on_incoming_attach(&mut self, attach: Attach, out: &mut Outbox) -> Result<(), ScopedError> {
        if attach.handle.0 > self.config.handle_max {
            return Err(ScopedError::connection(
                ConnectionError::FramingError,
                "Attach handle exceeds handle-max",
            ));
        }
        if self.input_handles.contains_key(&attach.handle) {
            return Err(ScopedError::session(
                SessionError::HandleInUse,
                "Attach on a handle already in use",
            ));
        }

        let expected_role = attach.role.opposite();
        let local = self.links.iter().find_map(|(key, link)| {
            (link.name == attach.name
                && link.role == expected_role
                && link.state == LinkState::AttachSent)
                .then_some(key)
        });

        match local {
            Some(key) => {
                let input_handle = attach.handle;
                let link = &mut self.links[key];
                let credit = link.on_incoming_attach(attach);
                self.input_handles.insert(input_handle, key);
                if let Some(link_flow) = credit {
                    self.push_link_flow(link_flow, out);
                }
            }
            None => {
                let key = self.links.vacant_key();
                if key as u64 > self.handle_max() as u64 {
                    return Err(ScopedError::session(
                        AmqpError::ResourceLimitExceeded,
                        "No handle left for a remote attach",
                    ));
                }
                self.link_serial += 1;
                let id = LinkId {
                    session: self.id,
                    key,
                    serial: self.link_serial,
                };
                let input_handle = attach.handle;
                let mut link = Link::remote(id, Handle(key as u32), attach);
                if let Some(reply) = link.send_attach() {
                    self.push(FrameBody::Attach(reply), out);
                }
                let credit = link.initial_credit();
                if let Some(relay) = link.take_relay() {
                    let _ = self.events.send(SessionEvent::IncomingLink(relay));
                }
                self.links.insert(link);
                self.input_handles.insert(input_handle, key);
                if let Some(link_flow) = credit {
                    self.push_link_flow(link_flow, out);
                }
            }
        }
        Ok(())
    }

    fn on_incoming_detach(&mut self, detach: Detach, out: &mut Outbox) -> Result<(), ScopedError> {
        let key = self.link_by_input_handle(detach.handle)?;
        let link = &mut self.links[key];
        if let Some(echo) = link.on_incoming_detach(detach) {
            out.push_back(Frame::new(self.outgoing_channel, FrameBody::Detach(echo)));
        }
        if self.links[key].is_detached() {
            self.remove_link(key);
        }
        Ok(())
    }

    /// The application asked to detach a link
    pub(crate) fn detach_link(
        &mut self,
        id: LinkId,
        closed: bool,
        error: Option<definitions::Error>,
        responder: oneshot::Sender<Result<(), link::Error>>,
        out: &mut Outbox,
    ) {
        let channel = self.outgoing_channel;
        let Some(link) = self.link_mut(id) else {
            let _ = responder.send(Ok(()));
            return;
        };
        if let Some(detach) = link.on_detach_requested(closed, error, responder) {
            out.push_back(Frame::new(channel, FrameBody::Detach(detach)));
        }
        if link.is_detached() {
            self.remove_link(id.key);
        }
    }

    /// Detaches a link because of a violation the peer committed on it
    fn fail_link(&mut self, key: usize, error: definitions::Error, out: &mut Outbox) {
        error!(channel = self.outgoing_channel, link = key, ?error, "detaching link");
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        if let Some(detach) = link.send_detach(true, Some(error.clone())) {
            out.push_back(Frame::new(self.outgoing_channel, FrameBody::Detach(detach)));
        }
        link.fail(link::Error::Detached(Some(error)));
        if link.is_detached() {
            self.remove_link(key);
        }
    }

    /* ------------------------------ transfers ----------------------------- */

    /// Queues a send on a link and sends whatever credit and window allow
    pub(crate) fn enqueue(
        &mut self,
        id: LinkId,
        pending: PendingSend,
        out: &mut Outbox,
    ) -> Result<(), ScopedError> {
        match self.link_mut(id) {
            Some(link) => link.enqueue(pending),
            None => {
                let _ = pending.responder.send(Err(SendError::Detached(None)));
                return Ok(());
            }
        }
        self.pump(out)
    }

    /// Emits Transfer frames while the remote incoming window and our
    /// outgoing window are open
    ///
    /// Links are served in key order; each link emits its queue in FIFO
    /// order until it runs out of credit.
    pub(crate) fn pump(&mut self, out: &mut Outbox) -> Result<(), ScopedError> {
        if !matches!(self.state, SessionState::Mapped) {
            return Ok(());
        }
        let keys: Vec<usize> = self.links.iter().map(|(key, _)| key).collect();
        for key in keys {
            loop {
                if self.remote_incoming_window == 0 {
                    trace!(channel = self.outgoing_channel, "remote incoming window closed");
                    return Ok(());
                }
                if self.outgoing_window == 0 && !self.reopen_outgoing_window(out) {
                    return Ok(());
                }
                let Some(link) = self.links.get_mut(key) else {
                    break;
                };
                let transfer = link
                    .next_transfer(&mut self.next_outgoing_delivery_id, self.max_frame_size)
                    .map_err(|err| {
                        ScopedError::connection(AmqpError::InternalError, &err.to_string())
                    })?;
                match transfer {
                    Some(transfer) => self.emit_transfer(key, transfer, out),
                    None => break,
                }
            }
            if let Some(link_flow) = self.links.get_mut(key).and_then(Link::try_finish_drain) {
                self.push_link_flow(link_flow, out);
            }
        }
        Ok(())
    }

    /// The outgoing window only bounds ourselves, so it is reset once used
    /// up and the new value is announced to the peer
    fn reopen_outgoing_window(&mut self, out: &mut Outbox) -> bool {
        if self.config.outgoing_window == 0 {
            trace!(channel = self.outgoing_channel, "outgoing window closed");
            return false;
        }
        self.outgoing_window = self.config.outgoing_window;
        let flow = self.flow(None);
        self.push(FrameBody::Flow(flow), out);
        true
    }

    fn emit_transfer(&mut self, key: usize, transfer: OutgoingTransfer, out: &mut Outbox) {
        let OutgoingTransfer {
            performative,
            payload,
            unsettled,
        } = transfer;
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.remote_incoming_window -= 1;
        self.outgoing_window = self.outgoing_window.saturating_sub(1);
        if let Some(delivery_id) = unsettled {
            self.outgoing_unsettled.insert(delivery_id, key);
        }
        self.push(
            FrameBody::Transfer {
                performative,
                payload,
            },
            out,
        );
    }

    fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
        out: &mut Outbox,
    ) -> Result<(), ScopedError> {
        if self.incoming_window == 0 {
            return Err(ScopedError::session(
                SessionError::WindowViolation,
                "Transfer received with incoming-window at 0",
            ));
        }
        self.incoming_window -= 1;
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);

        let key = self.link_by_input_handle(transfer.handle)?;
        let current = self.links[key].incomplete_delivery_id();
        let delivery_id = match (current, transfer.delivery_id) {
            (Some(current), Some(id)) if id != current => {
                return Err(ScopedError::session(
                    AmqpError::InvalidField,
                    "delivery-id changed within a delivery",
                ))
            }
            (Some(current), _) => current,
            (None, None) => {
                return Err(ScopedError::session(
                    AmqpError::InvalidField,
                    "First transfer of a delivery carries no delivery-id",
                ))
            }
            (None, Some(id)) => {
                if let Some(expected) = self.next_incoming_delivery_id {
                    if id != expected {
                        return Err(ScopedError::session(
                            AmqpError::InvalidField,
                            "delivery-id out of sequence",
                        ));
                    }
                }
                self.next_incoming_delivery_id = Some(id.wrapping_add(1));
                id
            }
        };

        match self.links[key].on_incoming_transfer(delivery_id, transfer, payload) {
            Ok(received) => {
                if let Some(delivery_id) = received.unsettled {
                    self.incoming_unsettled.insert(delivery_id, key);
                }
                if let Some(link_flow) = received.flow {
                    self.push_link_flow(link_flow, out);
                }
            }
            Err(error) => self.fail_link(key, error, out),
        }

        if self.incoming_window <= self.config.incoming_window / 2 {
            self.incoming_window = self.config.incoming_window;
            let flow = self.flow(None);
            self.push(FrameBody::Flow(flow), out);
        }
        Ok(())
    }

    /* -------------------------------- flow -------------------------------- */

    fn on_incoming_flow(&mut self, flow: Flow, out: &mut Outbox) -> Result<(), ScopedError> {
        let next_incoming_id = flow.next_incoming_id.unwrap_or(self.initial_outgoing_id);
        self.remote_incoming_window = next_incoming_id
            .wrapping_add(flow.incoming_window)
            .wrapping_sub(self.next_outgoing_id);
        self.remote_outgoing_window = flow.outgoing_window;
        self.outgoing_window = self.config.outgoing_window;
        let session_echo = flow.echo;

        match LinkFlow::try_from(flow) {
            Ok(link_flow) => {
                let key = self.link_by_input_handle(link_flow.handle)?;
                if let Some(reply) = self.links[key].on_incoming_flow(&link_flow) {
                    self.push_link_flow(reply, out);
                }
            }
            Err(_) => {
                if session_echo {
                    let flow = self.flow(None);
                    self.push(FrameBody::Flow(flow), out);
                }
            }
        }
        self.pump(out)
    }

    /// The application changed a receiver's credit
    pub(crate) fn set_credit(&mut self, id: LinkId, credit: Option<u32>, drain: bool, out: &mut Outbox) {
        let link_flow = self
            .link_mut(id)
            .and_then(|link| link.set_credit(credit, drain));
        if let Some(link_flow) = link_flow {
            self.push_link_flow(link_flow, out);
        }
    }

    /* ----------------------------- settlement ----------------------------- */

    fn on_incoming_disposition(&mut self, disposition: Disposition, out: &mut Outbox) {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        let in_range = |id: &DeliveryNumber| id.wrapping_sub(first) <= last.wrapping_sub(first);

        match disposition.role {
            // The peer receives what we sent
            Role::Receiver => {
                let ids: Vec<(DeliveryNumber, usize)> = self
                    .outgoing_unsettled
                    .iter()
                    .filter(|(id, _)| in_range(*id))
                    .map(|(id, key)| (*id, *key))
                    .collect();
                let mut resolved = false;
                for (delivery_id, key) in ids {
                    let Some(link) = self.links.get_mut(key) else {
                        continue;
                    };
                    if link.on_disposition_as_sender(
                        delivery_id,
                        disposition.settled,
                        disposition.state.as_ref(),
                    ) {
                        self.outgoing_unsettled.remove(&delivery_id);
                        resolved = true;
                    }
                }
                if resolved && !disposition.settled {
                    let echo = Disposition {
                        role: Role::Sender,
                        first,
                        last: disposition.last,
                        settled: true,
                        state: disposition.state,
                        batchable: false,
                    };
                    self.push(FrameBody::Disposition(echo), out);
                }
            }
            // The peer settles what it sent us
            Role::Sender => {
                if !disposition.settled {
                    return;
                }
                let ids: Vec<(DeliveryNumber, usize)> = self
                    .incoming_unsettled
                    .iter()
                    .filter(|(id, _)| in_range(*id))
                    .map(|(id, key)| (*id, *key))
                    .collect();
                for (delivery_id, key) in ids {
                    if let Some(link) = self.links.get_mut(key) {
                        link.settle_incoming(delivery_id);
                    }
                    self.incoming_unsettled.remove(&delivery_id);
                }
            }
        }
    }

    /// The application settled a received delivery
    pub(crate) fn dispose(
        &mut self,
        id: LinkId,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
        out: &mut Outbox,
    ) {
        let settled = self
            .link_mut(id)
            .map(|link| link.settle_incoming(delivery_id))
            .unwrap_or(false);
        if !settled {
            return;
        }
        self.incoming_unsettled.remove(&delivery_id);
        let disposition = Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(state),
            batchable: false,
        };
        self.push(FrameBody::Disposition(disposition), out);
    }

    /* ------------------------------- routing ------------------------------ */

    /// Handles a link level frame routed to this session
    ///
    /// Link scoped violations are handled here by detaching the link; the
    /// caller tears down the session or the connection for the wider scopes.
    pub(crate) fn on_incoming(&mut self, body: FrameBody, out: &mut Outbox) -> Result<(), ScopedError> {
        match self.state {
            SessionState::Mapped => {}
            // The peer has not seen our End yet
            SessionState::EndSent | SessionState::Discarding => return Ok(()),
            _ => return Err(ScopedError::illegal_state("Frame on a session that is not mapped")),
        }

        let result = match body {
            FrameBody::Attach(attach) => self.on_incoming_attach(attach, out),
            FrameBody::Flow(flow) => self.on_incoming_flow(flow, out),
            FrameBody::Transfer {
                performative,
                payload,
            } => self.on_incoming_transfer(performative, payload, out),
            FrameBody::Disposition(disposition) => {
                self.on_incoming_disposition(disposition, out);
                Ok(())
            }
            FrameBody::Detach(detach) => self.on_incoming_detach(detach, out),
            _ => Ok(()),
        };

        match result {
            Err(ScopedError::Link { link, error }) => {
                self.fail_link(link, error, out);
                Ok(())
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use ferrox_amqp_types::{
        definitions::{DeliveryTag, ErrorCondition, ReceiverSettleMode, SenderSettleMode},
        messaging::{Accepted, Source, Target},
    };

    use crate::link::{CreditMode, DeliveryOutcome, Sendable};

    use super::*;

    fn mapped_session(remote_incoming_window: u32) -> (Session, SessionRelay) {
        mapped_session_with(SessionConfig::default(), remote_incoming_window)
    }

    fn mapped_session_with(
        config: SessionConfig,
        remote_incoming_window: u32,
    ) -> (Session, SessionRelay) {
        let id = SessionId { key: 0, serial: 1 };
        let mut session = Session::new(id, 0, config, 512);
        let (tx, mut rx) = oneshot::channel();
        session.set_begin_responder(tx);
        let mut out = VecDeque::new();
        session.send_begin(&mut out).unwrap();
        session
            .on_incoming_begin(
                0,
                Begin {
                    remote_channel: Some(0),
                    next_outgoing_id: 0,
                    incoming_window: remote_incoming_window,
                    outgoing_window: 100,
                    handle_max: Handle(255),
                    offered_capabilities: None,
                    desired_capabilities: None,
                    properties: None,
                },
            )
            .unwrap();
        let relay = rx.try_recv().unwrap().unwrap();
        (session, relay)
    }

    fn link_config(name: &str, role: Role) -> LinkConfig {
        LinkConfig {
            name: name.to_string(),
            role,
            source: Some(Source::with_address("q1")),
            target: Some(Target::with_address("q1")),
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            max_message_size: None,
            initial_delivery_count: 0,
            credit_mode: CreditMode::Manual,
        }
    }

    fn attached_sender(session: &mut Session, out: &mut Outbox) -> LinkRelay {
        let (tx, mut rx) = oneshot::channel();
        session.attach_link(link_config("sender", Role::Sender), tx, out);
        let Some(Frame {
            body: FrameBody::Attach(mut attach),
            ..
        }) = out.pop_back()
        else {
            panic!("expecting an Attach");
        };
        attach.role = Role::Receiver;
        attach.handle = Handle(5);
        attach.initial_delivery_count = None;
        session.on_incoming(FrameBody::Attach(attach), out).unwrap();
        rx.try_recv().unwrap().unwrap()
    }

    fn grant(credit: u32, next_incoming_id: u32, incoming_window: u32) -> FrameBody {
        FrameBody::Flow(Flow {
            next_incoming_id: Some(next_incoming_id),
            incoming_window,
            next_outgoing_id: 0,
            outgoing_window: 100,
            handle: Some(Handle(5)),
            delivery_count: Some(0),
            link_credit: Some(credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        })
    }

    fn transfers(out: &mut Outbox) -> Vec<Transfer> {
        out.drain(..)
            .filter_map(|frame| match frame.body {
                FrameBody::Transfer { performative, .. } => Some(performative),
                _ => None,
            })
            .collect()
    }

    fn send(session: &mut Session, relay: &LinkRelay, out: &mut Outbox) -> oneshot::Receiver<Result<DeliveryOutcome, SendError>> {
        let (responder, rx) = oneshot::channel();
        let pending = PendingSend {
            sendable: Sendable::new(Bytes::from_static(b"message")),
            responder,
        };
        session.enqueue(relay.id, pending, out).unwrap();
        rx
    }

    #[test]
    fn begin_exchange_maps_the_session() {
        let (session, relay) = mapped_session(10);
        assert_eq!(session.state, SessionState::Mapped);
        assert_eq!(session.incoming_channel, Some(0));
        assert_eq!(relay.id, session.id);
    }

    #[test]
    fn closed_remote_window_suspends_transfers_until_flow() {
        let (mut session, _relay) = mapped_session(2);
        let mut out = VecDeque::new();
        let link = attached_sender(&mut session, &mut out);
        session.on_incoming(grant(10, 0, 2), &mut out).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(send(&mut session, &link, &mut out));
        }
        let sent = transfers(&mut out);
        assert_eq!(sent.len(), 2);

        // The peer received both and opens its window again
        let mut flow = grant(10, 2, 2);
        if let FrameBody::Flow(flow) = &mut flow {
            flow.handle = None;
            flow.delivery_count = None;
            flow.link_credit = None;
        }
        session.on_incoming(flow, &mut out).unwrap();
        let sent = transfers(&mut out);
        let ids: Vec<_> = sent.iter().map(|t| t.delivery_id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
    }

    #[test]
    fn used_up_outgoing_window_is_reopened_without_remote_flow() {
        let config = SessionConfig {
            outgoing_window: 3,
            ..Default::default()
        };
        let (mut session, _relay) = mapped_session_with(config, u32::MAX);
        let mut out = VecDeque::new();
        let link = attached_sender(&mut session, &mut out);
        session.on_incoming(grant(8, 0, u32::MAX), &mut out).unwrap();
        out.clear();

        let outcomes: Vec<_> = (0..8)
            .map(|_| send(&mut session, &link, &mut out))
            .collect();

        let mut sent = 0;
        let mut window_flows = 0;
        for frame in out.drain(..) {
            match frame.body {
                FrameBody::Transfer { .. } => sent += 1,
                FrameBody::Flow(flow) => {
                    assert_eq!(flow.handle, None);
                    assert_eq!(flow.outgoing_window, 3);
                    assert_eq!(flow.next_outgoing_id, sent);
                    window_flows += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sent, 8);
        assert_eq!(window_flows, 2);
        assert_eq!(outcomes.len(), 8);
    }

    #[test]
    fn transfer_ids_wrap_around() {
        let start = u32::MAX - 1;
        let config = SessionConfig {
            next_outgoing_id: start,
            ..Default::default()
        };
        let (mut session, _relay) = mapped_session_with(config, 2);
        let mut out = VecDeque::new();
        let link = attached_sender(&mut session, &mut out);
        session.on_incoming(grant(10, start, 2), &mut out).unwrap();

        let _outcomes: Vec<_> = (0..4)
            .map(|_| send(&mut session, &link, &mut out))
            .collect();
        assert_eq!(transfers(&mut out).len(), 2);
        assert_eq!(session.next_outgoing_id, 0);
        assert_eq!(session.remote_incoming_window, 0);

        // The peer took both, its next-incoming-id has wrapped to 0
        let mut flow = grant(10, 0, 2);
        if let FrameBody::Flow(flow) = &mut flow {
            flow.handle = None;
            flow.delivery_count = None;
            flow.link_credit = None;
        }
        session.on_incoming(flow, &mut out).unwrap();
        assert_eq!(session.remote_incoming_window, 2);

        let ids: Vec<_> = transfers(&mut out).iter().map(|t| t.delivery_id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
        assert_eq!(session.next_outgoing_id, 2);
    }

    #[test]
    fn disposition_range_resolves_unsettled_sends() {
        let (mut session, _relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let link = attached_sender(&mut session, &mut out);
        session.on_incoming(grant(10, 0, 100), &mut out).unwrap();

        let mut first = send(&mut session, &link, &mut out);
        let mut second = send(&mut session, &link, &mut out);
        out.clear();

        let disposition = Disposition {
            role: Role::Receiver,
            first: 0,
            last: Some(1),
            settled: false,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        };
        session
            .on_incoming(FrameBody::Disposition(disposition), &mut out)
            .unwrap();
        assert_eq!(first.try_recv().unwrap(), Ok(DeliveryOutcome::Accepted(Accepted {})));
        assert_eq!(second.try_recv().unwrap(), Ok(DeliveryOutcome::Accepted(Accepted {})));

        // Settled echo towards the receiver
        match out.pop_front().map(|frame| frame.body) {
            Some(FrameBody::Disposition(echo)) => {
                assert_eq!(echo.role, Role::Sender);
                assert!(echo.settled);
            }
            other => panic!("expecting a Disposition, found {:?}", other),
        }
    }

    #[test]
    fn unknown_delivery_ids_are_ignored() {
        let (mut session, _relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let disposition = Disposition {
            role: Role::Receiver,
            first: 40,
            last: Some(45),
            settled: true,
            state: None,
            batchable: false,
        };
        session
            .on_incoming(FrameBody::Disposition(disposition), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn transfer_on_unknown_handle_is_session_scoped() {
        let (mut session, _relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let transfer = Transfer {
            handle: Handle(3),
            delivery_id: Some(0),
            delivery_tag: Some(DeliveryTag::from(vec![0])),
            message_format: Some(0),
            settled: Some(true),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };
        let err = session
            .on_incoming(
                FrameBody::Transfer {
                    performative: transfer,
                    payload: Bytes::new(),
                },
                &mut out,
            )
            .unwrap_err();
        assert_eq!(
            err.error().condition,
            ErrorCondition::SessionError(SessionError::UnattachedHandle)
        );
    }

    #[test]
    fn attach_above_handle_max_is_connection_scoped() {
        let (mut session, _relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let attach = Attach {
            name: "link".to_string(),
            handle: Handle(1000),
            role: Role::Sender,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let err = session
            .on_incoming(FrameBody::Attach(attach), &mut out)
            .unwrap_err();
        assert_eq!(err.scope(), crate::error::ErrorScope::Connection);
    }

    #[test]
    fn remote_attach_is_answered_and_surfaced() {
        let (mut session, mut relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let attach = Attach {
            name: "incoming".to_string(),
            handle: Handle(0),
            role: Role::Sender,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: Some(Box::new(Source::with_address("q1"))),
            target: Some(Box::new(Target::with_address("q1"))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(7),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        session.on_incoming(FrameBody::Attach(attach), &mut out).unwrap();

        match out.pop_front().map(|frame| frame.body) {
            Some(FrameBody::Attach(reply)) => {
                assert_eq!(reply.role, Role::Receiver);
                assert_eq!(reply.name, "incoming");
            }
            other => panic!("expecting an Attach, found {:?}", other),
        }
        // Auto credit is granted right away
        match out.pop_front().map(|frame| frame.body) {
            Some(FrameBody::Flow(flow)) => {
                assert_eq!(flow.delivery_count, Some(7));
                assert_eq!(flow.link_credit, Some(crate::link::DEFAULT_CREDIT));
            }
            other => panic!("expecting a Flow, found {:?}", other),
        }
        match relay.events.try_recv() {
            Ok(SessionEvent::IncomingLink(link)) => assert_eq!(link.role, Role::Receiver),
            other => panic!("expecting an incoming link, found {:?}", other),
        }
    }

    #[test]
    fn remote_end_tears_down_links() {
        let (mut session, mut relay) = mapped_session(100);
        let mut out = VecDeque::new();
        let mut sender = attached_sender(&mut session, &mut out);
        out.clear();

        session.on_incoming_end(End { error: None }, &mut out).unwrap();
        assert!(session.is_unmapped());
        assert!(matches!(out.pop_front().map(|f| f.body), Some(FrameBody::End(_))));
        assert!(matches!(
            sender.events.try_recv(),
            Ok(link::LinkEvent::Detached(link::Error::SessionClosed(None)))
        ));
        assert!(matches!(relay.events.try_recv(), Ok(SessionEvent::Ended(Ok(())))));
    }
}
