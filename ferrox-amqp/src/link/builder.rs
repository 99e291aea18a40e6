//! Implements the builder for a link

use std::marker::PhantomData;

use ferrox_amqp_types::{
    definitions::{ReceiverSettleMode, Role, SenderSettleMode, SequenceNo},
    messaging::{Source, Target},
};
use tokio::sync::oneshot;

use crate::{control::ConnectionControl, session::SessionHandle};

use super::{
    handle::LinkHandle, AttachError, CreditMode, Error, LinkConfig, LinkRelay, Receiver, Sender,
};

/// Role markers of the link builder
pub mod role {
    /// Type state for a sending link
    #[derive(Debug)]
    pub struct Sender;

    /// Type state for a receiving link
    #[derive(Debug)]
    pub struct Receiver;
}

/// Type state for link::builder::Builder;
#[derive(Debug)]
pub struct WithoutName;

/// Type state for link::builder::Builder;
#[derive(Debug)]
pub struct WithName;

/// Builder for a Link
#[derive(Debug)]
pub struct Builder<Role, NameState> {
    /// The name of the link
    pub name: String,

    /// Settlement policy for the sender
    pub snd_settle_mode: SenderSettleMode,

    /// The settlement policy of the receiver
    ///
    /// `Second` is announced but deliveries are settled as in `First`.
    pub rcv_settle_mode: ReceiverSettleMode,

    /// The source for messages
    pub source: Option<Source>,

    /// The target for messages
    pub target: Option<Target>,

    /// Delivery-count of the first delivery; ignored for receivers
    pub initial_delivery_count: SequenceNo,

    /// The largest message this end accepts, `None` or 0 for no limit
    pub max_message_size: Option<u64>,

    /// Credit mode of the link. This has no effect if a sender is built
    pub credit_mode: CreditMode,

    role: PhantomData<Role>,
    name_state: PhantomData<NameState>,
}

impl<R> Builder<R, WithoutName> {
    pub(crate) fn new() -> Self {
        Self {
            name: String::new(),
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: None,
            target: None,
            initial_delivery_count: 0,
            max_message_size: None,
            credit_mode: CreditMode::default(),
            role: PhantomData,
            name_state: PhantomData,
        }
    }
}

impl<R, NameState> Builder<R, NameState> {
    /// The name of the link, unique per session and direction
    pub fn name(self, name: impl Into<String>) -> Builder<R, WithName> {
        Builder {
            name: name.into(),
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source,
            target: self.target,
            initial_delivery_count: self.initial_delivery_count,
            max_message_size: self.max_message_size,
            credit_mode: self.credit_mode,
            role: PhantomData,
            name_state: PhantomData,
        }
    }

    /// Settlement policy for the sender
    pub fn sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    /// The settlement policy of the receiver
    pub fn receiver_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    /// The source for messages
    pub fn source(mut self, source: impl Into<Source>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The target for messages
    pub fn target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// The maximum message size supported by the link endpoint
    pub fn max_message_size(mut self, max_size: u64) -> Self {
        self.max_message_size = Some(max_size);
        self
    }

    fn into_config(self, role: Role) -> LinkConfig {
        LinkConfig {
            name: self.name,
            role,
            source: Some(self.source.unwrap_or_default()),
            target: Some(self.target.unwrap_or_default()),
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            max_message_size: self.max_message_size,
            initial_delivery_count: self.initial_delivery_count,
            credit_mode: self.credit_mode,
        }
    }
}

impl<NameState> Builder<role::Sender, NameState> {
    /// Delivery-count of the first delivery sent on the link
    pub fn initial_delivery_count(mut self, count: SequenceNo) -> Self {
        self.initial_delivery_count = count;
        self
    }
}

impl<NameState> Builder<role::Receiver, NameState> {
    /// How credit is granted to the sender
    pub fn credit_mode(mut self, credit_mode: CreditMode) -> Self {
        self.credit_mode = credit_mode;
        self
    }
}

impl Builder<role::Sender, WithName> {
    /// Attach the link as a sender
    pub async fn attach(self, session: &mut SessionHandle) -> Result<Sender, AttachError> {
        let config = self.into_config(Role::Sender);
        let relay = attach(session, config).await?;
        Ok(Sender {
            inner: LinkHandle::new(relay, session.control.clone()),
        })
    }
}

impl Builder<role::Receiver, WithName> {
    /// Attach the link as a receiver
    pub async fn attach(self, session: &mut SessionHandle) -> Result<Receiver, AttachError> {
        let credit_mode = self.credit_mode;
        let config = self.into_config(Role::Receiver);
        let relay = attach(session, config).await?;
        Ok(Receiver {
            inner: LinkHandle::new(relay, session.control.clone()),
            credit_mode,
        })
    }
}

async fn attach(session: &mut SessionHandle, config: LinkConfig) -> Result<LinkRelay, AttachError> {
    let (responder, result) = oneshot::channel();
    session
        .control
        .send(ConnectionControl::Attach {
            session: session.id,
            config,
            responder,
        })
        .await
        .map_err(|_| Error::ConnectionClosed(None))?;
    result.await.map_err(|_| Error::ConnectionClosed(None))?
}
