//! Implementation of AMQP1.0 receiver

use ferrox_amqp_types::{
    definitions,
    messaging::{Accepted, DeliveryState, Modified, Rejected, Released, Source, Target},
};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::{control::ConnectionControl, session::SessionHandle};

use super::{
    builder::{self, WithoutName},
    handle::LinkHandle,
    AttachError, CreditMode, Delivery, Error, LinkEvent, LinkRelay,
};

/// An AMQP1.0 receiver
///
/// # Attach a new receiver with default configurations
///
/// ```rust,ignore
/// let mut receiver = Receiver::attach(
///     &mut session,
///     "rust-receiver-link-1", // link name
///     "q1"                    // Source address
/// ).await.unwrap();
///
/// let delivery = receiver.recv().await.unwrap();
/// receiver.accept(&delivery).await.unwrap();
///
/// receiver.close().await.unwrap();
/// ```
///
/// With the default [`CreditMode::Auto`], credit is granted on attach and
/// renewed as deliveries arrive. In [`CreditMode::Manual`] nothing arrives
/// before [`Receiver::set_credit`].
#[derive(Debug)]
pub struct Receiver {
    pub(crate) inner: LinkHandle,
    pub(crate) credit_mode: CreditMode,
}

impl Receiver {
    /// Creates a builder for [`Receiver`]
    pub fn builder() -> builder::Builder<builder::role::Receiver, WithoutName> {
        builder::Builder::new()
    }

    /// Attach the receiver link to a session with default configuration
    /// with the `name` and the source `address`
    pub async fn attach(
        session: &mut SessionHandle,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<Receiver, AttachError> {
        Self::builder()
            .name(name)
            .source(Source::with_address(address))
            .attach(session)
            .await
    }

    pub(crate) fn from_relay(relay: LinkRelay, control: mpsc::Sender<ConnectionControl>) -> Self {
        Self {
            inner: LinkHandle::new(relay, control),
            credit_mode: CreditMode::default(),
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

    /// How credit is granted on this link
    pub fn credit_mode(&self) -> CreditMode {
        self.credit_mode
    }

    /// Waits for the next delivery
    ///
    /// Fails once the link is torn down.
    pub async fn recv(&mut self) -> Result<Delivery, Error> {
        match self.inner.next_event().await? {
            LinkEvent::Delivery(delivery) => Ok(delivery),
            LinkEvent::Detached(err) => Err(err),
        }
    }

    /// Deliveries as they arrive, ending when the link is torn down
    ///
    /// The stream only yields while the sender has credit; granting more
    /// resumes it.
    pub fn deliveries(&mut self) -> impl Stream<Item = Delivery> + '_ {
        futures_util::stream::unfold(self, |receiver| async move {
            match receiver.recv().await {
                Ok(delivery) => Some((delivery, receiver)),
                Err(_) => None,
            }
        })
    }

    /// Sets the link credit
    pub async fn set_credit(&mut self, credit: u32) -> Result<(), Error> {
        self.flow(Some(credit), false).await
    }

    /// Asks the sender to use up or give back the outstanding credit
    pub async fn drain(&mut self) -> Result<(), Error> {
        self.flow(None, true).await
    }

    async fn flow(&mut self, credit: Option<u32>, drain: bool) -> Result<(), Error> {
        self.inner.poll_detached()?;
        self.inner
            .control
            .send(ConnectionControl::Flow {
                link: self.inner.id,
                credit,
                drain,
            })
            .await
            .map_err(|_| Error::ConnectionClosed(None))
    }

    /// Accept the message
    pub async fn accept(&mut self, delivery: &Delivery) -> Result<(), Error> {
        self.dispose(delivery, DeliveryState::Accepted(Accepted {}))
            .await
    }

    /// Reject the message
    pub async fn reject(
        &mut self,
        delivery: &Delivery,
        error: impl Into<Option<definitions::Error>>,
    ) -> Result<(), Error> {
        let state = DeliveryState::Rejected(Rejected {
            error: error.into(),
        });
        self.dispose(delivery, state).await
    }

    /// Release the message
    pub async fn release(&mut self, delivery: &Delivery) -> Result<(), Error> {
        self.dispose(delivery, DeliveryState::Released(Released {}))
            .await
    }

    /// Modify the message
    pub async fn modify(&mut self, delivery: &Delivery, modified: Modified) -> Result<(), Error> {
        self.dispose(delivery, DeliveryState::Modified(modified))
            .await
    }

    /// Settles the delivery with the given state
    ///
    /// Deliveries the sender sent pre-settled need no disposition; this is a
    /// no-op for them.
    pub async fn dispose(&mut self, delivery: &Delivery, state: DeliveryState) -> Result<(), Error> {
        self.inner.poll_detached()?;
        if delivery.settled || delivery.link != self.inner.id {
            return Ok(());
        }
        self.inner
            .control
            .send(ConnectionControl::Dispose {
                link: self.inner.id,
                delivery_id: delivery.delivery_id,
                state,
            })
            .await
            .map_err(|_| Error::ConnectionClosed(None))
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
