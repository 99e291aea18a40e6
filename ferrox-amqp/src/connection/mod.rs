//! Implements AMQP1.0 Connection
//!
//! [`Connection`] is the state machine of the connection endpoint. It owns
//! every session mapped on it and collects the frames they produce in an
//! outbox that the dispatch loop writes to the transport.

use std::{
    cmp::{max, min},
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use ferrox_amqp_types::{
    definitions::{self, AmqpError, MIN_MAX_FRAME_SIZE},
    performatives::{Close, Open},
    states::ConnectionState,
};
use slab::Slab;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tracing::debug;

use crate::{
    control::{ConnectionControl, SessionId},
    error::ScopedError,
    frames::amqp::{Frame, FrameBody},
    link::{AttachError, SendError},
    session::{self, BeginError, Session, SessionRelay},
};

mod builder;
pub(crate) mod engine;
mod error;
mod handle;
pub mod heartbeat;
mod mux;

pub use builder::*;
pub use error::*;
pub use handle::ConnectionHandle;

/// Default max-frame-size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Default channel-max
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Default bound on opening a connection and on waiting for the peer's Close
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames waiting to be written to the transport
pub(crate) type Outbox = VecDeque<Frame>;

/// The max-frame-size both peers can live with
///
/// This is the smaller of the two offers, never below 512.
pub fn negotiated_max_frame_size(local: u32, remote: u32) -> usize {
    max(MIN_MAX_FRAME_SIZE, min(local, remote) as usize)
}

/// An AMQP 1.0 Connection.
///
/// # Open a new [`Connection`] with default configuration
///
/// The engine runs over any duplex byte stream; establishing it (TCP, TLS
/// or an in-memory pipe) is left to the caller.
///
/// ```rust,ignore
/// let stream = TcpStream::connect("localhost:5672").await.unwrap();
/// let connection = Connection::open_with_stream("connection-1", stream).await.unwrap();
/// ```
///
/// ## Default configuration
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`max_frame_size`| [`DEFAULT_MAX_FRAME_SIZE`] |
/// |`channel_max`| [`DEFAULT_CHANNEL_MAX`] |
/// |`idle_time_out`| `None` |
/// |`open_timeout`| [`DEFAULT_OPEN_TIMEOUT`] |
///
/// # Customize configuration with [`Builder`]
///
/// ```rust,ignore
/// let connection = Connection::builder()
///     .container_id("connection-1")
///     .max_frame_size(4096)
///     .channel_max(64)
///     .idle_time_out(50_000u32)
///     .open_with_stream(stream)
///     .await
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    local_open: Open,
    remote_open: Option<Open>,

    agreed_channel_max: u16,
    max_frame_size: usize,

    sessions: Slab<Session>,
    session_serial: u64,
    session_by_incoming_channel: BTreeMap<u16, usize>,
    incoming_sessions: mpsc::UnboundedSender<SessionRelay>,

    pub(crate) outbox: Outbox,
}

/* ------------------------------- Public API ------------------------------- */
impl Connection {
    /// Creates a Builder for [`Connection`]
    pub fn builder() -> Builder<WithoutContainerId> {
        Builder::new()
    }

    /// Opens a connection with the default configuration, writing our
    /// protocol header first
    pub async fn open_with_stream<Io>(
        container_id: impl Into<String>,
        stream: Io,
    ) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Connection::builder()
            .container_id(container_id)
            .open_with_stream(stream)
            .await
    }

    /// Accepts a connection with the default configuration, reading the
    /// peer's protocol header first
    pub async fn accept_with_stream<Io>(
        container_id: impl Into<String>,
        stream: Io,
    ) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Connection::builder()
            .container_id(container_id)
            .accept_with_stream(stream)
            .await
    }

    /// Current state of the local endpoint
    pub fn local_state(&self) -> ConnectionState {
        self.state
    }

    /// The Open we sent or are about to send
    pub fn local_open(&self) -> &Open {
        &self.local_open
    }

    /// The Open the peer sent
    pub fn remote_open(&self) -> Option<&Open> {
        self.remote_open.as_ref()
    }

    /// The negotiated max-frame-size, 512 until both Opens are exchanged
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/* ------------------------------- Private API ------------------------------ */
impl Connection {
    pub(crate) fn new(
        state: ConnectionState,
        local_open: Open,
        incoming_sessions: mpsc::UnboundedSender<SessionRelay>,
    ) -> Self {
        let agreed_channel_max = local_open.channel_max.0;
        Self {
            state,
            local_open,
            remote_open: None,
            agreed_channel_max,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            sessions: Slab::new(),
            session_serial: 0,
            session_by_incoming_channel: BTreeMap::new(),
            incoming_sessions,
            outbox: VecDeque::new(),
        }
    }

    pub(crate) fn is_ended(&self) -> bool {
        matches!(self.state, ConnectionState::End)
    }

    fn local_error(condition: impl Into<definitions::ErrorCondition>, description: &str) -> Error {
        Error::Local(definitions::Error::new(
            condition,
            Some(description.to_string()),
        ))
    }

    /// The session behind a handle's id, with the outbox it writes to
    fn session_mut(&mut self, id: SessionId) -> Option<(&mut Session, &mut Outbox)> {
        let session = self
            .sessions
            .get_mut(id.key)
            .filter(|session| session.id.serial == id.serial)?;
        Some((session, &mut self.outbox))
    }

    /// Frees the channel of a session once both Ends have been exchanged
    fn drop_if_unmapped(&mut self, key: usize) {
        let unmapped = self
            .sessions
            .get(key)
            .map(Session::is_unmapped)
            .unwrap_or(false);
        if unmapped {
            debug!(channel = key, "session unmapped");
            self.sessions.remove(key);
            self.session_by_incoming_channel.retain(|_, k| *k != key);
        }
    }

    /// Emits our Open
    pub(crate) fn send_open(&mut self) -> Result<(), Error> {
        self.state = match self.state {
            ConnectionState::HeaderExchange => ConnectionState::OpenSent,
            ConnectionState::OpenReceived => ConnectionState::Opened,
            ConnectionState::HeaderSent => ConnectionState::OpenPipe,
            _ => return Err(Error::IllegalState),
        };
        let open = self.local_open.clone();
        self.outbox
            .push_back(Frame::new(0u16, FrameBody::Open(open)));
        Ok(())
    }

    /// Takes the peer's Open into account
    ///
    /// The proposal must have been checked against the 512 bytes minimum.
    pub(crate) fn on_incoming_open(&mut self, open: Open) -> Result<(), Error> {
        self.state = match self.state {
            ConnectionState::HeaderExchange => ConnectionState::OpenReceived,
            ConnectionState::OpenSent => ConnectionState::Opened,
            ConnectionState::ClosePipe => ConnectionState::CloseSent,
            _ => return Err(Self::local_error(AmqpError::IllegalState, "Unexpected Open")),
        };
        self.agreed_channel_max = min(self.local_open.channel_max.0, open.channel_max.0);
        self.max_frame_size =
            negotiated_max_frame_size(self.local_open.max_frame_size.0, open.max_frame_size.0);
        self.remote_open = Some(open);
        Ok(())
    }

    /// Emits our Close and tears every session down
    ///
    /// An Open is emitted first if the header exchange has just completed.
    /// Closing an already closing connection does nothing.
    pub(crate) fn send_close(&mut self, error: Option<definitions::Error>) -> Result<(), Error> {
        if matches!(
            self.state,
            ConnectionState::HeaderExchange | ConnectionState::OpenReceived
        ) {
            self.send_open()?;
        }
        self.state = match self.state {
            ConnectionState::Opened if error.is_some() => ConnectionState::Discarding,
            ConnectionState::Opened => ConnectionState::CloseSent,
            ConnectionState::CloseReceived => ConnectionState::End,
            ConnectionState::OpenSent => ConnectionState::ClosePipe,
            ConnectionState::OpenPipe => ConnectionState::OpenClosePipe,
            ConnectionState::ClosePipe
            | ConnectionState::OpenClosePipe
            | ConnectionState::CloseSent
            | ConnectionState::Discarding
            | ConnectionState::End => return Ok(()),
            _ => return Err(Error::IllegalState),
        };
        debug!(?error, "closing connection");
        self.on_teardown(error.clone());
        self.outbox
            .push_back(Frame::new(0u16, FrameBody::Close(Close { error })));
        Ok(())
    }

    /// Handles the peer's Close, echoing it if we have not closed yet
    pub(crate) fn on_incoming_close(&mut self, close: Close) -> Result<(), Error> {
        match self.state {
            ConnectionState::Opened
            | ConnectionState::OpenSent
            | ConnectionState::OpenReceived => {
                self.state = ConnectionState::CloseReceived;
                self.on_teardown(close.error.clone());
                self.send_close(None)?;
            }
            ConnectionState::CloseSent
            | ConnectionState::Discarding
            | ConnectionState::ClosePipe
            | ConnectionState::OpenClosePipe => {
                self.state = ConnectionState::End;
                self.on_teardown(close.error.clone());
            }
            _ => return Err(Self::local_error(AmqpError::IllegalState, "Unexpected Close")),
        }
        match close.error {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(()),
        }
    }

    /// Tears every session down without exchanging End
    pub(crate) fn on_teardown(&mut self, error: Option<definitions::Error>) {
        for (_, session) in self.sessions.iter_mut() {
            session.on_teardown(error.clone());
        }
        self.sessions.clear();
        self.session_by_incoming_channel.clear();
    }

    /// Maps a new session on the lowest free channel and emits its Begin
    fn begin_session(
        &mut self,
        config: session::SessionConfig,
        responder: tokio::sync::oneshot::Sender<Result<SessionRelay, BeginError>>,
    ) -> Result<(), Error> {
        if !matches!(self.state, ConnectionState::Opened) {
            let _ = responder.send(Err(BeginError::IllegalConnectionState));
            return Ok(());
        }
        let key = self.sessions.vacant_key();
        if key > self.agreed_channel_max as usize {
            let _ = responder.send(Err(BeginError::ChannelMaxReached));
            return Ok(());
        }
        self.session_serial += 1;
        let id = SessionId {
            key,
            serial: self.session_serial,
        };
        let mut session = Session::new(id, key as u16, config, self.max_frame_size);
        session.set_begin_responder(responder);
        session
            .send_begin(&mut self.outbox)
            .map_err(scoped_to_local)?;
        self.sessions.insert(session);
        Ok(())
    }

    /// Applies a command from one of the handles
    pub(crate) fn on_control(&mut self, control: ConnectionControl) -> Result<(), Error> {
        match control {
            ConnectionControl::Close { error } => self.send_close(error)?,
            ConnectionControl::Begin { config, responder } => {
                self.begin_session(config, responder)?
            }
            ConnectionControl::End {
                session,
                error,
                responder,
            } => {
                match self.session_mut(session) {
                    Some((s, outbox)) => s.on_end_requested(error, responder, outbox),
                    None => {
                        let _ = responder.send(Err(session::Error::IllegalState));
                    }
                }
                self.drop_if_unmapped(session.key);
            }
            ConnectionControl::Attach {
                session,
                config,
                responder,
            } => match self.session_mut(session) {
                Some((s, outbox)) => s.attach_link(config, responder, outbox),
                None => {
                    let _ = responder.send(Err(AttachError::IllegalSessionState));
                }
            },
            ConnectionControl::Detach {
                link,
                closed,
                error,
                responder,
            } => match self.session_mut(link.session) {
                Some((s, outbox)) => s.detach_link(link, closed, error, responder, outbox),
                // Ended sessions took their links with them
                None => {
                    let _ = responder.send(Ok(()));
                }
            },
            ConnectionControl::Send { link, pending } => match self.session_mut(link.session) {
                Some((s, outbox)) => s.enqueue(link, pending, outbox).map_err(scoped_to_local)?,
                None => {
                    let _ = pending.responder.send(Err(SendError::SessionClosed(None)));
                }
            },
            ConnectionControl::Flow {
                link,
                credit,
                drain,
            } => {
                if let Some((s, outbox)) = self.session_mut(link.session) {
                    s.set_credit(link, credit, drain, outbox);
                }
            }
            ConnectionControl::Dispose {
                link,
                delivery_id,
                state,
            } => {
                if let Some((s, outbox)) = self.session_mut(link.session) {
                    s.dispose(link, delivery_id, state, outbox);
                }
            }
        }
        Ok(())
    }
}

/// Violations that reach the connection close it with their condition
fn scoped_to_local(err: ScopedError) -> Error {
    Error::Local(err.error().clone())
}

#[cfg(test)]
mod tests {
    use ferrox_amqp_types::{
        definitions::ErrorCondition,
        performatives::{Begin, ChannelMax, End, MaxFrameSize},
    };
    use tokio::sync::oneshot;

    use crate::session::{SessionConfig, SessionEvent};

    use super::*;

    fn open(container_id: &str, max_frame_size: u32, channel_max: u16) -> Open {
        Open {
            container_id: container_id.to_string(),
            hostname: None,
            max_frame_size: MaxFrameSize(max_frame_size),
            channel_max: ChannelMax(channel_max),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    fn opened(local_max_frame_size: u32) -> (Connection, mpsc::UnboundedReceiver<SessionRelay>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(
            ConnectionState::HeaderExchange,
            open("local", local_max_frame_size, 1),
            tx,
        );
        connection.send_open().unwrap();
        connection
            .on_incoming_open(open("remote", 2048, 255))
            .unwrap();
        connection.outbox.clear();
        (connection, rx)
    }

    fn begin(remote_channel: Option<u16>) -> FrameBody {
        FrameBody::Begin(Begin {
            remote_channel,
            next_outgoing_id: 0,
            incoming_window: 100,
            outgoing_window: 100,
            handle_max: definitions::Handle(255),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        })
    }

    #[test]
    fn max_frame_size_is_the_smaller_offer() {
        assert_eq!(negotiated_max_frame_size(1024, 2048), 1024);
        assert_eq!(negotiated_max_frame_size(4096, 2048), 2048);
        assert_eq!(negotiated_max_frame_size(u32::MAX, u32::MAX), u32::MAX as usize);
    }

    #[test]
    fn open_exchange_negotiates_limits() {
        let (connection, _) = opened(1024);
        assert_eq!(connection.local_state(), ConnectionState::Opened);
        assert_eq!(connection.max_frame_size(), 1024);
        assert_eq!(connection.agreed_channel_max, 1);
    }

    #[test]
    fn remote_close_is_echoed() {
        let (mut connection, _) = opened(1024);
        connection
            .on_incoming(Frame::new(0u16, FrameBody::Close(Close { error: None })))
            .unwrap();
        assert!(connection.is_ended());
        assert!(matches!(
            connection.outbox.pop_front().map(Frame::into_body),
            Some(FrameBody::Close(Close { error: None }))
        ));
    }

    #[test]
    fn remote_close_with_error_is_reported() {
        let (mut connection, _) = opened(1024);
        let error = definitions::Error::new(AmqpError::InternalError, None);
        let result = connection.on_incoming(Frame::new(
            0u16,
            FrameBody::Close(Close {
                error: Some(error.clone()),
            }),
        ));
        assert!(matches!(result, Err(Error::Remote(e)) if e == error));
        assert!(connection.is_ended());
    }

    #[test]
    fn local_close_before_open_pipelines_open_and_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection =
            Connection::new(ConnectionState::HeaderExchange, open("local", 512, 1), tx);
        connection.send_close(None).unwrap();
        assert_eq!(connection.local_state(), ConnectionState::ClosePipe);
        let bodies: Vec<_> = connection.outbox.drain(..).map(Frame::into_body).collect();
        assert!(matches!(bodies[0], FrameBody::Open(_)));
        assert!(matches!(bodies[1], FrameBody::Close(_)));
    }

    #[test]
    fn begin_beyond_channel_max_is_refused() {
        let (mut connection, _) = opened(1024);
        let mut results = Vec::new();
        for _ in 0..3 {
            let (responder, rx) = oneshot::channel();
            connection
                .on_control(ConnectionControl::Begin {
                    config: SessionConfig::default(),
                    responder,
                })
                .unwrap();
            results.push(rx);
        }
        // channel-max 1 leaves channels 0 and 1
        assert_eq!(connection.outbox.len(), 2);
        assert_eq!(
            results[2].try_recv().unwrap().unwrap_err(),
            BeginError::ChannelMaxReached
        );
    }

    #[test]
    fn frame_on_unknown_channel_is_not_found() {
        let (mut connection, _) = opened(1024);
        let err = connection
            .on_incoming(Frame::new(3u16, FrameBody::End(End { error: None })))
            .unwrap_err();
        match err {
            Error::Local(error) => {
                assert_eq!(error.condition, ErrorCondition::AmqpError(AmqpError::NotFound))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn remote_begin_is_answered_and_surfaced() {
        let (mut connection, mut incoming) = opened(1024);
        connection
            .on_incoming(Frame::new(1u16, begin(None)))
            .unwrap();
        match connection.outbox.pop_front() {
            Some(Frame {
                channel: 0,
                body: FrameBody::Begin(reply),
            }) => assert_eq!(reply.remote_channel, Some(1)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(incoming.try_recv().is_ok());
    }

    #[test]
    fn begin_above_channel_max_is_a_framing_error() {
        let (mut connection, _) = opened(1024);
        let err = connection
            .on_incoming(Frame::new(7u16, begin(None)))
            .unwrap_err();
        assert_eq!(err.to_close_error().unwrap().condition, ErrorCondition::ConnectionError(
            definitions::ConnectionError::FramingError
        ));
    }

    #[test]
    fn close_cascades_to_sessions() {
        let (mut connection, _) = opened(1024);
        let (responder, mut rx) = oneshot::channel();
        connection
            .on_control(ConnectionControl::Begin {
                config: SessionConfig::default(),
                responder,
            })
            .unwrap();
        connection
            .on_incoming(Frame::new(0u16, begin(Some(0))))
            .unwrap();
        let mut relay = rx.try_recv().unwrap().unwrap();

        connection.send_close(None).unwrap();
        assert_eq!(connection.local_state(), ConnectionState::CloseSent);
        assert!(matches!(
            relay.events.try_recv(),
            Ok(SessionEvent::Ended(Err(session::Error::ConnectionClosed(None))))
        ));
    }
}
