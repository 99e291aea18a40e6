//! Deliveries and their outcomes

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use ferrox_amqp_types::{
    definitions::{DeliveryNumber, DeliveryTag, MessageFormat},
    messaging::{Accepted, DeliveryState, Modified, Rejected, Released},
};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::{control::LinkId, Payload};

use super::SendError;

/// A message waiting to be sent
///
/// The payload is opaque to the engine and is put on the wire as is.
#[derive(Debug, Clone)]
pub struct Sendable {
    pub(crate) payload: Payload,
    pub(crate) message_format: MessageFormat,
    pub(crate) settled: Option<bool>,
    pub(crate) delivery_tag: Option<DeliveryTag>,
}

impl Sendable {
    /// Creates a new sendable with message format 0
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            message_format: 0,
            settled: None,
            delivery_tag: None,
        }
    }

    /// Sets the message format
    pub fn message_format(mut self, message_format: MessageFormat) -> Self {
        self.message_format = message_format;
        self
    }

    /// Asks for the delivery to be sent pre-settled
    ///
    /// Only honoured when the link's sender settle mode is `Mixed`.
    pub fn settled(mut self, settled: bool) -> Self {
        self.settled = Some(settled);
        self
    }

    /// Overrides the delivery tag, which otherwise is derived from the
    /// link's delivery-count
    pub fn delivery_tag(mut self, tag: impl Into<Vec<u8>>) -> Self {
        self.delivery_tag = Some(DeliveryTag::from(tag.into()));
        self
    }

    /// Size of the payload in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl<T> From<T> for Sendable
where
    T: Into<Payload>,
{
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// A queued send and the caller waiting for its outcome
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub sendable: Sendable,
    pub responder: oneshot::Sender<Result<DeliveryOutcome, SendError>>,
}

/// The outcome of a sent delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The delivery was sent pre-settled, or the receiver settled it
    /// without stating an outcome
    Settled,

    /// The receiver accepted the message
    Accepted(Accepted),

    /// The receiver rejected the message
    Rejected(Rejected),

    /// The receiver released the message
    Released(Released),

    /// The receiver modified the message
    Modified(Modified),
}

impl DeliveryOutcome {
    /// Whether the receiver accepted the message
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted(_))
    }

    /// Maps the state carried by a Disposition. Non-terminal states do not
    /// resolve a delivery unless it has been settled.
    pub(crate) fn from_disposition(settled: bool, state: Option<DeliveryState>) -> Option<Self> {
        match state {
            Some(DeliveryState::Accepted(accepted)) => Some(DeliveryOutcome::Accepted(accepted)),
            Some(DeliveryState::Rejected(rejected)) => Some(DeliveryOutcome::Rejected(rejected)),
            Some(DeliveryState::Released(released)) => Some(DeliveryOutcome::Released(released)),
            Some(DeliveryState::Modified(modified)) => Some(DeliveryOutcome::Modified(modified)),
            Some(DeliveryState::Received(_)) | None if settled => Some(DeliveryOutcome::Settled),
            Some(DeliveryState::Received(_)) | None => None,
        }
    }
}

pin_project! {
    /// Resolves once the delivery is settled
    ///
    /// Returned by [`Sender::send_nowait`](super::Sender::send_nowait). The
    /// message is queued on the link whether or not the future is polled.
    #[derive(Debug)]
    pub struct DeliveryFut {
        #[pin]
        outcome: oneshot::Receiver<Result<DeliveryOutcome, SendError>>,
    }
}

impl DeliveryFut {
    pub(crate) fn new(outcome: oneshot::Receiver<Result<DeliveryOutcome, SendError>>) -> Self {
        Self { outcome }
    }
}

impl Future for DeliveryFut {
    type Output = Result<DeliveryOutcome, SendError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().outcome.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The engine stopped without answering
            Poll::Ready(Err(_)) => Poll::Ready(Err(SendError::ConnectionClosed(None))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A message received on a link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub(crate) link: LinkId,
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message_format: MessageFormat,
    pub(crate) settled: bool,
    pub(crate) payload: Payload,
}

impl Delivery {
    /// Session scoped delivery id
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Delivery tag chosen by the sender
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// Message format of the payload
    pub fn message_format(&self) -> MessageFormat {
        self.message_format
    }

    /// Whether the sender sent the delivery pre-settled
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Reassembled message bytes
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the delivery and takes the message bytes
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use ferrox_amqp_types::messaging::Received;

    use super::*;

    #[test]
    fn terminal_states_resolve_deliveries() {
        assert_eq!(
            DeliveryOutcome::from_disposition(false, Some(DeliveryState::Accepted(Accepted {}))),
            Some(DeliveryOutcome::Accepted(Accepted {}))
        );
        assert_eq!(
            DeliveryOutcome::from_disposition(true, Some(DeliveryState::Released(Released {}))),
            Some(DeliveryOutcome::Released(Released {}))
        );
    }

    #[test]
    fn non_terminal_states_wait_for_settlement() {
        let received = DeliveryState::Received(Received {
            section_number: 0,
            section_offset: 10,
        });
        assert_eq!(
            DeliveryOutcome::from_disposition(false, Some(received.clone())),
            None
        );
        assert_eq!(DeliveryOutcome::from_disposition(false, None), None);
        assert_eq!(
            DeliveryOutcome::from_disposition(true, Some(received)),
            Some(DeliveryOutcome::Settled)
        );
    }

    #[tokio::test]
    async fn delivery_fut_reports_a_vanished_engine() {
        let (tx, rx) = oneshot::channel();
        let fut = DeliveryFut::new(rx);
        drop(tx);
        assert_eq!(fut.await, Err(SendError::ConnectionClosed(None)));
    }

    #[test]
    fn sendable_from_static_bytes() {
        let sendable = Sendable::from(&b"hello"[..]).settled(true);
        assert_eq!(sendable.len(), 5);
        assert_eq!(sendable.settled, Some(true));
        assert_eq!(sendable.message_format, 0);
    }
}
