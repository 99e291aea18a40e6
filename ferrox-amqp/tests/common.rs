#![allow(dead_code)]

use ferrox_amqp::{
    frames::amqp::{Frame, FrameBody},
    transport::{accept_negotiation, protocol_header::ProtocolHeader, Transport},
    types::{
        performatives::{ChannelMax, MaxFrameSize, Open},
        states::ConnectionState,
    },
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;

pub const BUFFER: usize = 64 * 1024;

pub fn open(container_id: &str, max_frame_size: u32, idle_time_out: Option<u32>) -> Open {
    Open {
        container_id: container_id.to_string(),
        hostname: None,
        max_frame_size: MaxFrameSize(max_frame_size),
        channel_max: ChannelMax(255),
        idle_time_out,
        outgoing_locales: None,
        incoming_locales: None,
        offered_capabilities: None,
        desired_capabilities: None,
        properties: None,
    }
}

/// A peer driven frame by frame from the test
pub struct RawPeer {
    pub transport: Transport<DuplexStream>,
}

impl RawPeer {
    /// Answers the protocol header and binds the stream without frame size
    /// limits of its own
    pub async fn accept(mut io: DuplexStream) -> Self {
        let mut state = ConnectionState::Start;
        accept_negotiation(&mut io, &mut state, ProtocolHeader::amqp())
            .await
            .unwrap();
        Self {
            transport: Transport::bind(io, BUFFER, BUFFER, None),
        }
    }

    /// Reads the engine's Open and answers with `open`
    pub async fn exchange_open(&mut self, open: Open) -> Open {
        let remote = match self.recv().await {
            FrameBody::Open(remote) => remote,
            other => panic!("expected Open, found {:?}", other),
        };
        self.send(0, FrameBody::Open(open)).await;
        remote
    }

    /// The next frame that is not a heartbeat
    pub async fn recv(&mut self) -> FrameBody {
        self.recv_frame().await.into_body()
    }

    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            let frame = self
                .transport
                .next()
                .await
                .expect("stream closed")
                .unwrap();
            if !matches!(frame.body(), FrameBody::Empty) {
                return frame;
            }
        }
    }

    pub async fn send(&mut self, channel: u16, body: FrameBody) {
        self.transport.send(Frame::new(channel, body)).await.unwrap();
    }
}
