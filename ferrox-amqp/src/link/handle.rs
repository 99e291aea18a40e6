use std::collections::VecDeque;

use ferrox_amqp_types::{
    definitions,
    messaging::{Source, Target},
};
use tokio::sync::{mpsc, oneshot};

use crate::control::{ConnectionControl, LinkId};

use super::{Error, LinkEvent, LinkRelay};

/// The part shared by [`Sender`](super::Sender) and [`Receiver`](super::Receiver)
#[derive(Debug)]
pub(crate) struct LinkHandle {
    pub id: LinkId,
    pub name: String,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub remote_max_message_size: Option<u64>,
    pub control: mpsc::Sender<ConnectionControl>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    /// Events taken off the channel while looking for a teardown
    pub buffered: VecDeque<LinkEvent>,
    /// Set once the engine reported the link gone
    pub detached: Option<Error>,
    /// Set once a Detach has been requested
    pub detach_requested: bool,
}

impl LinkHandle {
    pub fn new(relay: LinkRelay, control: mpsc::Sender<ConnectionControl>) -> Self {
        Self {
            id: relay.id,
            name: relay.name,
            source: relay.source,
            target: relay.target,
            remote_max_message_size: relay.remote_max_message_size,
            control,
            events: relay.events,
            buffered: VecDeque::new(),
            detached: None,
            detach_requested: false,
        }
    }

    /// Picks up a teardown reported since the last call, without waiting
    pub fn poll_detached(&mut self) -> Result<(), Error> {
        if self.detached.is_none() {
            while let Ok(event) = self.events.try_recv() {
                match event {
                    LinkEvent::Detached(err) => {
                        self.detached = Some(err);
                        break;
                    }
                    event => self.buffered.push_back(event),
                }
            }
        }
        match &self.detached {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Waits for the next event
    ///
    /// Deliveries that arrived before a teardown are still handed out.
    pub async fn next_event(&mut self) -> Result<LinkEvent, Error> {
        if let Some(event) = self.buffered.pop_front() {
            return Ok(event);
        }
        if let Some(err) = &self.detached {
            return Err(err.clone());
        }
        match self.events.recv().await {
            Some(LinkEvent::Detached(err)) => {
                self.detached = Some(err.clone());
                Err(err)
            }
            Some(event) => Ok(event),
            None => {
                let err = Error::ConnectionClosed(None);
                self.detached = Some(err.clone());
                Err(err)
            }
        }
    }

    pub async fn detach(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        if let Some(err) = &self.detached {
            return Err(err.clone());
        }
        self.detach_requested = true;
        let (responder, result) = oneshot::channel();
        self.control
            .send(ConnectionControl::Detach {
                link: self.id,
                closed,
                error,
                responder,
            })
            .await
            .map_err(|_| Error::ConnectionClosed(None))?;
        result.await.map_err(|_| Error::ConnectionClosed(None))?
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if self.detached.is_none() && !self.detach_requested {
            // Best effort, the engine ignores links that are already gone
            let (responder, _) = oneshot::channel();
            let _ = self.control.try_send(ConnectionControl::Detach {
                link: self.id,
                closed: true,
                error: None,
                responder,
            });
        }
    }
}
