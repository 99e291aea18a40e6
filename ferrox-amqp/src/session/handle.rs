use std::collections::VecDeque;

use ferrox_amqp_types::definitions::{self, Role};
use tokio::sync::{mpsc, oneshot};

use crate::{
    control::{ConnectionControl, SessionId},
    link::{IncomingLink, LinkRelay, Receiver, Sender},
};

use super::{Error, SessionEvent, SessionRelay};

/// A handle to a session
///
/// Links are attached through the handle. Dropping it without calling
/// [`end`](SessionHandle::end) ends the session.
#[derive(Debug)]
pub struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) control: mpsc::Sender<ConnectionControl>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    // Remote links seen while waiting for the end
    incoming_links: VecDeque<LinkRelay>,
    ended: Option<Result<(), Error>>,
    end_requested: bool,
}

impl SessionHandle {
    pub(crate) fn new(relay: SessionRelay, control: mpsc::Sender<ConnectionControl>) -> Self {
        Self {
            id: relay.id,
            control,
            events: relay.events,
            incoming_links: VecDeque::new(),
            ended: None,
            end_requested: false,
        }
    }

    /// Whether the session has ended
    pub fn is_ended(&mut self) -> bool {
        while self.ended.is_none() {
            match self.events.try_recv() {
                Ok(SessionEvent::IncomingLink(relay)) => self.incoming_links.push_back(relay),
                Ok(SessionEvent::Ended(result)) => self.ended = Some(result),
                Err(_) => break,
            }
        }
        self.ended.is_some()
    }

    /// Waits for the next event, `None` once the session has ended
    async fn next_incoming_link(&mut self) -> Option<LinkRelay> {
        if self.ended.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(SessionEvent::IncomingLink(relay)) => Some(relay),
            Some(SessionEvent::Ended(result)) => {
                self.ended = Some(result);
                None
            }
            None => {
                self.ended = Some(Err(Error::ConnectionClosed(None)));
                None
            }
        }
    }

    /// Waits for a link the peer attaches on this session
    ///
    /// The link has already been answered with the mirrored terminus.
    /// Links attached before [`on_end`](SessionHandle::on_end) or
    /// [`is_ended`](SessionHandle::is_ended) saw the end are still handed
    /// out, already detached. Returns `None` after that.
    pub async fn accept_link(&mut self) -> Option<IncomingLink> {
        let relay = match self.incoming_links.pop_front() {
            Some(relay) => relay,
            None => self.next_incoming_link().await?,
        };
        let control = self.control.clone();
        let link = match relay.role {
            Role::Sender => IncomingLink::Sender(Sender::from_relay(relay, control)),
            Role::Receiver => IncomingLink::Receiver(Receiver::from_relay(relay, control)),
        };
        Some(link)
    }

    /// Waits until the session ends and returns how it ended
    ///
    /// Links the peer attaches in the meantime are kept for
    /// [`accept_link`](SessionHandle::accept_link).
    pub async fn on_end(&mut self) -> Result<(), Error> {
        while let Some(relay) = self.next_incoming_link().await {
            self.incoming_links.push_back(relay);
        }
        self.ended
            .clone()
            .unwrap_or(Err(Error::ConnectionClosed(None)))
    }

    /// End the session
    pub async fn end(&mut self) -> Result<(), Error> {
        self.end_inner(None).await
    }

    /// End the session with an error
    pub async fn end_with_error(&mut self, error: impl Into<definitions::Error>) -> Result<(), Error> {
        self.end_inner(Some(error.into())).await
    }

    async fn end_inner(&mut self, error: Option<definitions::Error>) -> Result<(), Error> {
        if self.is_ended() {
            return match &self.ended {
                Some(Ok(())) | None => Err(Error::IllegalState),
                Some(Err(err)) => Err(err.clone()),
            };
        }
        self.end_requested = true;
        let (responder, result) = oneshot::channel();
        self.control
            .send(ConnectionControl::End {
                session: self.id,
                error,
                responder,
            })
            .await
            .map_err(|_| Error::ConnectionClosed(None))?;
        let result = result
            .await
            .unwrap_or(Err(Error::ConnectionClosed(None)));
        self.ended = Some(result.clone());
        result
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.ended.is_none() && !self.end_requested {
            let (responder, _) = oneshot::channel();
            let _ = self.control.try_send(ConnectionControl::End {
                session: self.id,
                error: None,
                responder,
            });
        }
    }
}
