//! Connection builder

use std::{marker::PhantomData, time::Duration};

use ferrox_amqp_types::{
    definitions::{Milliseconds, MIN_MAX_FRAME_SIZE},
    performatives::{ChannelMax, MaxFrameSize, Open},
    states::ConnectionState,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tracing::debug;

use crate::transport::{
    self,
    protocol_header::ProtocolHeader,
    sasl::{NoSasl, SaslNegotiator},
    Transport,
};

use super::{
    engine::ConnectionEngine, Connection, ConnectionHandle, OpenError, DEFAULT_CHANNEL_MAX,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_OPEN_TIMEOUT,
};

/// Default buffer size of the control channel shared by every handle of a
/// connection
pub const DEFAULT_CONTROL_CHAN_BUF: usize = 128;

/// Type state for [`Builder`]
#[derive(Debug)]
pub struct WithoutContainerId {}

/// Type state for [`Builder`]
#[derive(Debug)]
pub struct WithContainerId {}

/// Connection builder
#[derive(Debug)]
pub struct Builder<Mode, S = NoSasl> {
    /// The id of the source container
    pub container_id: String,

    /// The name of the target host
    pub hostname: Option<String>,

    /// Proposed maximum frame size; must be at least 512
    pub max_frame_size: u32,

    /// The maximum channel number that can be used on the connection
    pub channel_max: u16,

    /// Idle time-out announced to the peer, in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Buffer size of the control channel
    pub buffer_size: usize,

    /// Bound on the header, SASL and Open exchange, and on waiting for the
    /// peer to answer our Close
    pub open_timeout: Duration,

    /// Security layer run before the AMQP header
    pub sasl: Option<S>,

    marker: PhantomData<Mode>,
}

impl Default for Builder<WithoutContainerId> {
    fn default() -> Self {
        Self {
            container_id: String::new(),
            hostname: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_time_out: None,
            buffer_size: DEFAULT_CONTROL_CHAN_BUF,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            sasl: None,
            marker: PhantomData,
        }
    }
}

impl Builder<WithoutContainerId> {
    /// Creates a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Mode, S> Builder<Mode, S> {
    /// The id of the source container
    pub fn container_id(self, id: impl Into<String>) -> Builder<WithContainerId, S> {
        Builder {
            container_id: id.into(),
            hostname: self.hostname,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: self.idle_time_out,
            buffer_size: self.buffer_size,
            open_timeout: self.open_timeout,
            sasl: self.sasl,
            marker: PhantomData,
        }
    }

    /// The name of the target host
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Proposed maximum frame size
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// The maximum channel number
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Idle time-out in milliseconds
    pub fn idle_time_out(mut self, idle_time_out: Milliseconds) -> Self {
        self.idle_time_out = Some(idle_time_out);
        self
    }

    /// Buffer size of the control channel
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Bound on opening and on the closing handshake
    pub fn open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Runs `sasl` after the SASL protocol header and before the AMQP one
    pub fn sasl<S2>(self, sasl: S2) -> Builder<Mode, S2>
    where
        S2: SaslNegotiator,
    {
        Builder {
            container_id: self.container_id,
            hostname: self.hostname,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: self.idle_time_out,
            buffer_size: self.buffer_size,
            open_timeout: self.open_timeout,
            sasl: Some(sasl),
            marker: PhantomData,
        }
    }
}

impl<S> Builder<WithContainerId, S>
where
    S: SaslNegotiator,
{
    /// Opens the connection as the initiating peer
    ///
    /// Each protocol header is written before the peer's is read. Fails with
    /// [`OpenError::ConnectionTimeout`] if the peer has not answered within
    /// the open timeout.
    pub async fn open_with_stream<Io>(self, stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let open_timeout = self.open_timeout;
        tokio::time::timeout(open_timeout, self.open_inner(stream))
            .await
            .map_err(|_| OpenError::ConnectionTimeout)?
    }

    /// Opens the connection as the accepting peer
    ///
    /// Each protocol header of the peer is read before ours is written.
    /// Fails with [`OpenError::ConnectionTimeout`] if the peer has not
    /// completed the exchange within the open timeout.
    pub async fn accept_with_stream<Io>(self, stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let open_timeout = self.open_timeout;
        tokio::time::timeout(open_timeout, self.accept_inner(stream))
            .await
            .map_err(|_| OpenError::ConnectionTimeout)?
    }

    async fn open_inner<Io>(mut self, mut stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.check_max_frame_size()?;
        let mut local_state = ConnectionState::Start;

        if let Some(mut sasl) = self.sasl.take() {
            transport::negotiate(&mut stream, &mut local_state, ProtocolHeader::sasl()).await?;
            sasl.negotiate(&mut stream).await?;
            debug!("SASL negotiation succeeded");
            local_state = ConnectionState::Start;
        }

        transport::negotiate(&mut stream, &mut local_state, ProtocolHeader::amqp()).await?;
        self.start(stream, local_state).await
    }

    async fn accept_inner<Io>(mut self, mut stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.check_max_frame_size()?;
        let mut local_state = ConnectionState::Start;

        if let Some(mut sasl) = self.sasl.take() {
            transport::accept_negotiation(&mut stream, &mut local_state, ProtocolHeader::sasl())
                .await?;
            sasl.negotiate(&mut stream).await?;
            debug!("SASL negotiation succeeded");
            local_state = ConnectionState::Start;
        }

        transport::accept_negotiation(&mut stream, &mut local_state, ProtocolHeader::amqp())
            .await?;
        self.start(stream, local_state).await
    }

    fn check_max_frame_size(&self) -> Result<(), OpenError> {
        match (self.max_frame_size as usize) < MIN_MAX_FRAME_SIZE {
            true => Err(OpenError::InvalidNegotiation {
                max_frame_size: self.max_frame_size,
            }),
            false => Ok(()),
        }
    }

    fn local_open(&self) -> Open {
        Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: MaxFrameSize(self.max_frame_size),
            channel_max: ChannelMax(self.channel_max),
            idle_time_out: self.idle_time_out,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Exchanges Open over a stream whose AMQP header has been exchanged and
    /// spawns the dispatch loop
    async fn start<Io>(
        self,
        stream: Io,
        local_state: ConnectionState,
    ) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel(self.buffer_size.max(1));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(local_state, self.local_open(), incoming_tx);

        // Until the peer's Open arrives we only know our own limits
        let local_idle_timeout = self
            .idle_time_out
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(u64::from(ms)));
        let transport = Transport::bind(
            stream,
            self.max_frame_size as usize,
            MIN_MAX_FRAME_SIZE,
            local_idle_timeout,
        );

        let engine =
            ConnectionEngine::open(transport, connection, control_rx, self.open_timeout).await?;
        let max_frame_size = engine.max_frame_size();
        let handle = engine.spawn();
        Ok(ConnectionHandle::new(
            control_tx,
            handle,
            incoming_rx,
            max_frame_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = Builder::new().container_id("test");
        assert_eq!(builder.container_id, "test");
        assert_eq!(builder.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(builder.channel_max, DEFAULT_CHANNEL_MAX);
        assert_eq!(builder.idle_time_out, None);
        assert_eq!(builder.buffer_size, DEFAULT_CONTROL_CHAN_BUF);
        assert_eq!(builder.open_timeout, DEFAULT_OPEN_TIMEOUT);
        assert!(builder.sasl.is_none());
    }

    #[test]
    fn local_open_carries_the_configuration() {
        let open = Builder::new()
            .container_id("test")
            .hostname("localhost")
            .max_frame_size(4096)
            .channel_max(9)
            .idle_time_out(5000)
            .local_open();
        assert_eq!(open.container_id, "test");
        assert_eq!(open.hostname.as_deref(), Some("localhost"));
        assert_eq!(open.max_frame_size.0, 4096);
        assert_eq!(open.channel_max.0, 9);
        assert_eq!(open.idle_time_out, Some(5000));
    }

    #[tokio::test]
    async fn max_frame_size_below_minimum_is_rejected_before_any_io() {
        // Any write would fail the mock
        let mock = tokio_test::io::Builder::new().build();
        let result = Builder::new()
            .container_id("test")
            .max_frame_size(256)
            .open_with_stream(mock)
            .await;
        assert!(matches!(
            result,
            Err(OpenError::InvalidNegotiation {
                max_frame_size: 256
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_header_exchange_after_open_timeout() {
        // The peer never answers our header
        let mock = tokio_test::io::Builder::new()
            .write(b"AMQP\x00\x01\x00\x00")
            .wait(Duration::from_secs(3600))
            .build();
        let result = Builder::new()
            .container_id("test")
            .open_timeout(Duration::from_secs(5))
            .open_with_stream(mock)
            .await;
        assert!(matches!(result, Err(OpenError::ConnectionTimeout)));
    }
}
