//! Framed transport over a duplex byte stream
//!
//! Before any frame flows, [`negotiate`] and [`accept_negotiation`] exchange the
//! 8-byte protocol header directly on the stream. Afterwards the stream is
//! bound into a [`Transport`], which is a `Sink<Frame>` and a
//! `Stream<Item = Result<Frame, Error>>` enforcing the negotiated frame size
//! limits and the receive idle deadline.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use ferrox_amqp_types::states::ConnectionState;
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::trace;

use crate::frames::amqp::{Frame, FrameCodec};

mod error;
mod idle_timeout;
pub mod protocol_header;
pub mod sasl;

pub use error::{Error, NegotiationError};
use idle_timeout::IdleTimeout;
use protocol_header::ProtocolHeader;

pin_project! {
    /// Frame level transport
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, FrameCodec>,
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds a stream whose protocol header has already been exchanged
    ///
    /// `max_decode_frame_size` limits inbound frames, `max_encode_frame_size`
    /// outbound ones. Both are updated once Open has been exchanged.
    pub fn bind(
        io: Io,
        max_decode_frame_size: usize,
        max_encode_frame_size: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let framed = Framed::new(
            io,
            FrameCodec::new(max_decode_frame_size, max_encode_frame_size),
        );
        Self {
            framed,
            idle_timeout: idle_timeout
                .filter(|d| !d.is_zero())
                .map(IdleTimeout::new),
        }
    }

    /// Sets both frame size limits to the negotiated value
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        let codec = self.framed.codec_mut();
        codec.set_max_decode_frame_size(max_frame_size);
        codec.set_max_encode_frame_size(max_frame_size);
        self
    }

    /// The current inbound and outbound frame size limits
    pub fn max_frame_sizes(&self) -> (usize, usize) {
        let codec = self.framed.codec();
        (codec.max_decode_frame_size(), codec.max_encode_frame_size())
    }

    /// Sets the deadline within which some frame must be received,
    /// `None` or zero disables it
    pub fn set_idle_timeout(&mut self, duration: Option<Duration>) -> &mut Self {
        self.idle_timeout = duration.filter(|d| !d.is_zero()).map(IdleTimeout::new);
        self
    }

    /// The current receive deadline
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.as_ref().map(IdleTimeout::duration)
    }
}

/// Writes our header, then reads and checks the peer's
///
/// Used by the side that initiates the stream.
pub async fn negotiate<Io>(
    io: &mut Io,
    local_state: &mut ConnectionState,
    proto_header: ProtocolHeader,
) -> Result<ProtocolHeader, NegotiationError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    send_proto_header(io, local_state, proto_header.clone()).await?;
    recv_proto_header(io, local_state, &proto_header).await
}

/// Reads the peer's header first and answers with ours
///
/// Our header is written even when the peer's does not match, so that the
/// peer learns which version we speak before the stream is closed.
pub async fn accept_negotiation<Io>(
    io: &mut Io,
    local_state: &mut ConnectionState,
    proto_header: ProtocolHeader,
) -> Result<ProtocolHeader, NegotiationError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    match recv_proto_header(io, local_state, &proto_header).await {
        Ok(incoming) => {
            send_proto_header(io, local_state, proto_header).await?;
            Ok(incoming)
        }
        Err(NegotiationError::VersionMismatch { expected, found }) => {
            let buf: [u8; 8] = expected.clone().into();
            io.write_all(&buf).await?;
            io.flush().await?;
            Err(NegotiationError::VersionMismatch { expected, found })
        }
        Err(err) => Err(err),
    }
}

async fn send_proto_header<Io>(
    io: &mut Io,
    local_state: &mut ConnectionState,
    proto_header: ProtocolHeader,
) -> Result<(), NegotiationError>
where
    Io: AsyncWrite + Unpin,
{
    let next_state = match local_state {
        ConnectionState::Start => ConnectionState::HeaderSent,
        ConnectionState::HeaderReceived => ConnectionState::HeaderExchange,
        _ => return Err(NegotiationError::IllegalState),
    };
    trace!(header = ?proto_header, "SEND");
    let buf: [u8; 8] = proto_header.into();
    io.write_all(&buf).await?;
    io.flush().await?;
    *local_state = next_state;
    Ok(())
}

async fn recv_proto_header<Io>(
    io: &mut Io,
    local_state: &mut ConnectionState,
    proto_header: &ProtocolHeader,
) -> Result<ProtocolHeader, NegotiationError>
where
    Io: AsyncRead + Unpin,
{
    let next_state = match local_state {
        ConnectionState::Start => ConnectionState::HeaderReceived,
        ConnectionState::HeaderSent => ConnectionState::HeaderExchange,
        _ => return Err(NegotiationError::IllegalState),
    };

    let mut inbound_buf = [0u8; 8];
    io.read_exact(&mut inbound_buf).await?;
    trace!(header = ?inbound_buf, "RECV");

    match ProtocolHeader::try_from(inbound_buf) {
        Ok(incoming) if incoming == *proto_header => {
            *local_state = next_state;
            Ok(incoming)
        }
        _ => {
            *local_state = ConnectionState::End;
            Err(NegotiationError::VersionMismatch {
                expected: proto_header.clone(),
                found: inbound_buf,
            })
        }
    }
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.project().framed.start_send(item).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(delay) = this.idle_timeout.as_mut() {
                    delay.reset();
                }
                Poll::Ready(next.map(|result| result.map_err(Into::into)))
            }
            Poll::Pending => match this.idle_timeout.as_mut() {
                Some(delay) => match Pin::new(delay).poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Some(Err(Error::ConnectionTimeout))),
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Pending,
            },
        }
    }
}
