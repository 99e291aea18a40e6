//! The dispatch loop of a connection
//!
//! One task per connection reads frames from the transport, applies commands
//! from the handles and ticks the heartbeat. Every event runs to completion
//! against the [`Connection`] state machine, after which the frames it queued
//! are written out in order.

use std::{future, io, pin::Pin, time::Duration};

use ferrox_amqp_types::{
    definitions::{self, AmqpError, MIN_MAX_FRAME_SIZE},
    performatives::Open,
    states::ConnectionState,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::Sleep,
};
use tracing::{debug, error, instrument, trace};

use crate::{
    control::ConnectionControl,
    frames::amqp::{Frame, FrameBody},
    transport::{self, Transport},
};

use super::{heartbeat::HeartBeat, Connection, Error, OpenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Running {
    Continue,
    Stop,
}

#[derive(Debug)]
pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    connection: Connection,
    control: mpsc::Receiver<ConnectionControl>,
    control_closed: bool,
    heartbeat: HeartBeat,
    close_timeout: Duration,
    close_deadline: Option<Pin<Box<Sleep>>>,
}

fn millis(value: Option<u32>) -> Option<Duration> {
    value
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(u64::from(ms)))
}

/// Resolves once our Close has gone unanswered for too long
async fn close_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Exchanges Open frames without starting the dispatch loop
    ///
    /// The protocol headers must have been exchanged already. Once running,
    /// the loop gives the peer `close_timeout` to answer our Close.
    pub(crate) async fn open(
        transport: Transport<Io>,
        connection: Connection,
        control: mpsc::Receiver<ConnectionControl>,
        close_timeout: Duration,
    ) -> Result<Self, OpenError> {
        let mut engine = Self {
            transport,
            connection,
            control,
            control_closed: false,
            heartbeat: HeartBeat::never(),
            close_timeout,
            close_deadline: None,
        };

        engine.connection.send_open()?;
        engine.flush_outbox().await?;

        loop {
            let frame = match engine.transport.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(OpenError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Transport closed before Open was received",
                    )))
                }
            };
            trace!(channel = frame.channel, frame = ?frame.body, "RECV");

            match frame.body {
                FrameBody::Open(open) => {
                    let max_frame_size = open.max_frame_size.0;
                    if (max_frame_size as usize) < MIN_MAX_FRAME_SIZE {
                        let error = definitions::Error::new(
                            AmqpError::InvalidField,
                            Some(format!(
                                "max-frame-size {} is below the minimum of {}",
                                max_frame_size, MIN_MAX_FRAME_SIZE
                            )),
                        );
                        let _ = engine.connection.send_close(Some(error));
                        let _ = engine.flush_outbox().await;
                        return Err(OpenError::InvalidNegotiation { max_frame_size });
                    }
                    engine.on_remote_open(open)?;
                    return Ok(engine);
                }
                FrameBody::Close(close) => {
                    let error = close.error.clone();
                    let _ = engine.connection.on_incoming_close(close);
                    let _ = engine.flush_outbox().await;
                    return Err(OpenError::RemoteClosed(error));
                }
                FrameBody::Empty => {}
                _ => return Err(OpenError::IllegalState),
            }
        }
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.connection.max_frame_size()
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Applies the negotiated limits to the transport and starts the
    /// heartbeat
    fn on_remote_open(&mut self, open: Open) -> Result<(), Error> {
        let remote_idle_timeout = millis(open.idle_time_out);
        self.connection.on_incoming_open(open)?;

        let max_frame_size = self.connection.max_frame_size();
        self.transport.set_max_frame_size(max_frame_size);

        let local_idle_timeout = millis(self.connection.local_open().idle_time_out);
        let deadline = remote_idle_timeout
            .map(|timeout| timeout * 2)
            .or(local_idle_timeout);
        self.transport.set_idle_timeout(deadline);
        self.heartbeat = HeartBeat::for_remote_idle_timeout(remote_idle_timeout);

        debug!(
            max_frame_size,
            channel_max = self.connection.agreed_channel_max,
            ?deadline,
            "connection opened"
        );
        Ok(())
    }

    fn running(&self) -> Running {
        match self.connection.is_ended() {
            true => Running::Stop,
            false => Running::Continue,
        }
    }

    fn on_incoming(&mut self, incoming: Option<Result<Frame, transport::Error>>) -> Result<Running, Error> {
        match incoming {
            Some(frame) => self.connection.on_incoming(frame?)?,
            None => {
                return match self.connection.local_state() {
                    ConnectionState::CloseSent
                    | ConnectionState::Discarding
                    | ConnectionState::End => Ok(Running::Stop),
                    _ => Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Transport closed by the peer",
                    ))),
                }
            }
        }
        Ok(self.running())
    }

    fn on_control(&mut self, control: Option<ConnectionControl>) -> Result<Running, Error> {
        match control {
            Some(control) => self.connection.on_control(control)?,
            // Every handle is gone
            None => {
                self.control_closed = true;
                self.connection.send_close(None)?;
            }
        }
        Ok(self.running())
    }

    fn on_heartbeat(&mut self) -> Result<Running, Error> {
        if let ConnectionState::Opened = self.connection.local_state() {
            self.connection.outbox.push_back(Frame::empty());
        }
        Ok(self.running())
    }

    /// Starts the wait for the peer's Close once ours is out
    fn arm_close_deadline(&mut self) {
        let closing = matches!(
            self.connection.local_state(),
            ConnectionState::CloseSent | ConnectionState::Discarding
        );
        if closing && self.close_deadline.is_none() {
            trace!(timeout = ?self.close_timeout, "waiting for the remote Close");
            self.close_deadline = Some(Box::pin(tokio::time::sleep(self.close_timeout)));
        }
    }

    #[instrument(name = "SEND", skip_all)]
    async fn flush_outbox(&mut self) -> Result<(), Error> {
        if self.connection.outbox.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.connection.outbox.pop_front() {
            trace!(channel = frame.channel, frame = ?frame.body);
            self.transport.feed(frame).await?;
        }
        self.transport.flush().await?;
        Ok(())
    }

    /// Closes with the error's condition where one applies and tears every
    /// session down
    async fn on_fatal(&mut self, err: &Error) {
        error!(error = %err, "connection failed");
        if let Some(error) = err.to_close_error() {
            let _ = self.connection.send_close(Some(error));
        }
        let _ = self.flush_outbox().await;
        self.connection.on_teardown(err.to_teardown_error());
    }

    async fn event_loop(mut self) -> Result<(), Error> {
        let outcome = loop {
            let result = tokio::select! {
                _ = self.heartbeat.next() => self.on_heartbeat(),
                incoming = self.transport.next() => self.on_incoming(incoming),
                control = self.control.recv(), if !self.control_closed => self.on_control(control),
                _ = close_deadline(&mut self.close_deadline) => Err(Error::ConnectionTimeout),
            };

            let result = match result {
                Ok(running) => self.flush_outbox().await.map(|_| running),
                Err(err) => Err(err),
            };

            match result {
                Ok(Running::Continue) => self.arm_close_deadline(),
                Ok(Running::Stop) => break Ok(()),
                Err(err) => {
                    self.on_fatal(&err).await;
                    break Err(err);
                }
            }
        };

        let _ = self.transport.close().await;
        debug!("dispatch loop exited");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ferrox_amqp_types::{
        definitions::{AmqpError, ErrorCondition},
        performatives::{ChannelMax, Close, MaxFrameSize, Open},
        states::ConnectionState,
    };
    use futures_util::{SinkExt, StreamExt};
    use tokio::{io::DuplexStream, sync::mpsc};

    use super::*;

    const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

    fn open(container_id: &str, max_frame_size: u32, idle_time_out: Option<u32>) -> Open {
        Open {
            container_id: container_id.to_string(),
            hostname: None,
            max_frame_size: MaxFrameSize(max_frame_size),
            channel_max: ChannelMax(8),
            idle_time_out,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Both transports bound as after a header exchange
    fn pair(
        local: Open,
    ) -> (
        Transport<DuplexStream>,
        Connection,
        Transport<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let local_max = local.max_frame_size.0 as usize;
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Connection::new(ConnectionState::HeaderExchange, local, tx);
        let transport = Transport::bind(a, local_max, MIN_MAX_FRAME_SIZE, None);
        let peer = Transport::bind(b, 64 * 1024, 64 * 1024, None);
        (transport, connection, peer)
    }

    #[tokio::test]
    async fn open_negotiates_transport_limits() {
        let (transport, connection, mut peer) = pair(open("local", 1024, None));
        let (_control_tx, control_rx) = mpsc::channel(8);

        let remote = tokio::spawn(async move {
            let frame = peer.next().await.unwrap().unwrap();
            assert!(matches!(frame.body, FrameBody::Open(_)));
            peer.send(Frame::new(0u16, FrameBody::Open(open("remote", 2048, Some(1000)))))
                .await
                .unwrap();
            peer
        });

        let engine = ConnectionEngine::open(transport, connection, control_rx, CLOSE_TIMEOUT)
            .await
            .unwrap();
        let _peer = remote.await.unwrap();

        assert_eq!(engine.max_frame_size(), 1024);
        assert_eq!(engine.transport.max_frame_sizes(), (1024, 1024));
        assert_eq!(
            engine.transport.idle_timeout(),
            Some(Duration::from_millis(2000))
        );
        assert!(engine.heartbeat.is_active());
    }

    #[tokio::test]
    async fn remote_open_below_minimum_is_refused() {
        let (transport, connection, mut peer) = pair(open("local", 1024, None));
        let (_control_tx, control_rx) = mpsc::channel(8);

        let remote = tokio::spawn(async move {
            let _open = peer.next().await.unwrap().unwrap();
            peer.send(Frame::new(0u16, FrameBody::Open(open("remote", 256, None))))
                .await
                .unwrap();
            peer.next().await.unwrap().unwrap()
        });

        let result = ConnectionEngine::open(transport, connection, control_rx, CLOSE_TIMEOUT).await;
        assert!(matches!(
            result,
            Err(OpenError::InvalidNegotiation {
                max_frame_size: 256
            })
        ));

        match remote.await.unwrap().body {
            FrameBody::Close(Close { error: Some(error) }) => assert_eq!(
                error.condition,
                ErrorCondition::AmqpError(AmqpError::InvalidField)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_the_connection() {
        let (transport, connection, mut peer) = pair(open("local", 1024, None));
        let (control_tx, control_rx) = mpsc::channel(8);

        let remote = tokio::spawn(async move {
            let _open = peer.next().await.unwrap().unwrap();
            peer.send(Frame::new(0u16, FrameBody::Open(open("remote", 1024, None))))
                .await
                .unwrap();
            let close = peer.next().await.unwrap().unwrap();
            assert!(matches!(close.body, FrameBody::Close(Close { error: None })));
            peer.send(Frame::new(0u16, FrameBody::Close(Close { error: None })))
                .await
                .unwrap();
        });

        let engine = ConnectionEngine::open(transport, connection, control_rx, CLOSE_TIMEOUT)
            .await
            .unwrap();
        let handle = engine.spawn();
        drop(control_tx);

        remote.await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_close_times_out() {
        let (transport, connection, mut peer) = pair(open("local", 1024, None));
        let (control_tx, control_rx) = mpsc::channel(8);

        let remote = tokio::spawn(async move {
            let _open = peer.next().await.unwrap().unwrap();
            peer.send(Frame::new(0u16, FrameBody::Open(open("remote", 1024, None))))
                .await
                .unwrap();
            let close = peer.next().await.unwrap().unwrap();
            assert!(matches!(close.body, FrameBody::Close(_)));
            // Never echoed
            peer
        });

        let engine = ConnectionEngine::open(transport, connection, control_rx, CLOSE_TIMEOUT)
            .await
            .unwrap();
        let handle = engine.spawn();
        drop(control_tx);

        let _peer = remote.await.unwrap();
        let start = tokio::time::Instant::now();
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::ConnectionTimeout)
        ));
        assert!(start.elapsed() <= CLOSE_TIMEOUT);
    }
}
