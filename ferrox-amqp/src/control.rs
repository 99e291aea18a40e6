//! Commands sent from the application handles to the dispatch loop

use ferrox_amqp_types::{
    definitions::{self, DeliveryNumber},
    messaging::DeliveryState,
};
use tokio::sync::oneshot;

use crate::{
    link::{self, delivery::PendingSend, AttachError, LinkConfig, LinkRelay},
    session::{self, BeginError, SessionConfig, SessionRelay},
};

/// Identifies a session owned by a connection
///
/// Slab keys are reused once an endpoint is gone, the serial tells a stale
/// handle apart from the endpoint that took over its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionId {
    pub key: usize,
    pub serial: u64,
}

/// Identifies a link owned by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkId {
    pub session: SessionId,
    pub key: usize,
    pub serial: u64,
}

/// A command for the connection engine
#[derive(Debug)]
pub(crate) enum ConnectionControl {
    Close {
        error: Option<definitions::Error>,
    },
    Begin {
        config: SessionConfig,
        responder: oneshot::Sender<Result<SessionRelay, BeginError>>,
    },
    End {
        session: SessionId,
        error: Option<definitions::Error>,
        responder: oneshot::Sender<Result<(), session::Error>>,
    },
    Attach {
        session: SessionId,
        config: LinkConfig,
        responder: oneshot::Sender<Result<LinkRelay, AttachError>>,
    },
    Detach {
        link: LinkId,
        closed: bool,
        error: Option<definitions::Error>,
        responder: oneshot::Sender<Result<(), link::Error>>,
    },
    Send {
        link: LinkId,
        pending: PendingSend,
    },
    Flow {
        link: LinkId,
        credit: Option<u32>,
        drain: bool,
    },
    Dispose {
        link: LinkId,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
    },
}
