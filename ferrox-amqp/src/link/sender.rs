//! Implementation of AMQP1.0 sender

use ferrox_amqp_types::{
    definitions,
    messaging::{Source, Target},
};
use tokio::sync::oneshot;

use crate::{control::ConnectionControl, session::SessionHandle};

use super::{
    builder::{self, WithoutName},
    delivery::PendingSend,
    handle::LinkHandle,
    AttachError, DeliveryFut, DeliveryOutcome, Error, LinkEvent, LinkRelay, Sendable, SendError,
};

/// An AMQP1.0 sender
///
/// # Attach a new sender with default configurations
///
/// ```rust,ignore
/// let mut sender = Sender::attach(
///     &mut session,           // mutable reference to SessionHandle
///     "rust-sender-link-1",   // link name
///     "q1"                    // Target address
/// ).await.unwrap();
///
/// let outcome = sender.send(&b"hello AMQP"[..]).await.unwrap();
///
/// // Detach sender with closing Detach performatives
/// sender.close().await.unwrap();
/// ```
///
/// Sends that find no credit or no session window are queued and go out in
/// the order they were made once the receiver grants more.
#[derive(Debug)]
pub struct Sender {
    pub(crate) inner: LinkHandle,
}

impl Sender {
    /// Creates a builder for [`Sender`]
    pub fn builder() -> builder::Builder<builder::role::Sender, WithoutName> {
        builder::Builder::new()
    }

    /// Attach the sender link to a session with default configuration
    /// with the `name` and the target `address`
    pub async fn attach(
        session: &mut SessionHandle,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<Sender, AttachError> {
        Self::builder()
            .name(name)
            .target(Target::with_address(address))
            .attach(session)
            .await
    }

    pub(crate) fn from_relay(
        relay: LinkRelay,
        control: tokio::sync::mpsc::Sender<ConnectionControl>,
    ) -> Self {
        Self {
            inner: LinkHandle::new(relay, control),
        }
    }

    /// Name of the link
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Source of the link
    pub fn source(&self) -> Option<&Source> {
        self.inner.source.as_ref()
    }

    /// Target of the link
    pub fn target(&self) -> Option<&Target> {
        self.inner.target.as_ref()
    }

    /// Largest message the receiver accepts, if it announced a limit
    pub fn max_message_size(&self) -> Option<u64> {
        self.inner.remote_max_message_size
    }

    /// Send a message and wait for its outcome
    pub async fn send(
        &mut self,
        sendable: impl Into<Sendable>,
    ) -> Result<DeliveryOutcome, SendError> {
        self.send_nowait(sendable).await?.await
    }

    /// Queue a message and return a future that resolves to its outcome
    ///
    /// The message keeps its place in the link's queue whether or not the
    /// returned future is awaited.
    pub async fn send_nowait(
        &mut self,
        sendable: impl Into<Sendable>,
    ) -> Result<DeliveryFut, SendError> {
        self.inner.poll_detached()?;

        let sendable = sendable.into();
        if let Some(max_message_size) = self.inner.remote_max_message_size {
            if sendable.len() as u64 > max_message_size {
                return Err(SendError::MessageSizeExceeded {
                    size: sendable.len(),
                    max_message_size,
                });
            }
        }

        let (responder, outcome) = oneshot::channel();
        self.inner
            .control
            .send(ConnectionControl::Send {
                link: self.inner.id,
                pending: PendingSend {
                    sendable,
                    responder,
                },
            })
            .await
            .map_err(|_| SendError::ConnectionClosed(None))?;
        Ok(DeliveryFut::new(outcome))
    }

    /// Waits until the link is torn down and returns why
    pub async fn on_detach(&mut self) -> Error {
        loop {
            match self.inner.next_event().await {
                Ok(LinkEvent::Delivery(_)) => continue,
                Ok(LinkEvent::Detached(err)) | Err(err) => return err,
            }
        }
    }

    /// Detach the link without closing it
    pub async fn detach(mut self) -> Result<(), Error> {
        self.inner.detach(false, None).await
    }

    /// Detach the link with an error
    pub async fn detach_with_error(
        mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        self.inner.detach(false, Some(error.into())).await
    }

    /// Detach and close the link
    pub async fn close(mut self) -> Result<(), Error> {
        self.inner.detach(true, None).await
    }

    /// Detach and close the link with an error
    pub async fn close_with_error(
        mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        self.inner.detach(true, Some(error.into())).await
    }
}
