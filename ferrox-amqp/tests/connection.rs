use std::time::Duration;

use ferrox_amqp::{
    connection::{self, OpenError},
    frames::amqp::FrameBody,
    session,
    transport::{
        accept_negotiation,
        protocol_header::ProtocolHeader,
        sasl::{SaslError, SaslNegotiator},
    },
    types::{
        definitions::{self, AmqpError, ConnectionError, ErrorCondition},
        performatives::{Begin, Close, End},
        states::ConnectionState,
    },
    Connection, Session,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod common;

use common::{open, RawPeer, BUFFER};

#[tokio::test]
async fn max_frame_size_is_the_smaller_offer() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        let remote = peer.exchange_open(open("peer", 2048, None)).await;
        assert_eq!(remote.max_frame_size.0, 1024);
        assert_eq!(remote.container_id, "client");

        assert!(matches!(peer.recv().await, FrameBody::Close(Close { error: None })));
        peer.send(0, FrameBody::Close(Close { error: None })).await;
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .max_frame_size(1024)
        .open_with_stream(client)
        .await
        .unwrap();
    assert_eq!(connection.max_frame_size(), 1024);

    connection.close().await.unwrap();
    peer.await.unwrap();
    assert!(connection.is_closed());
}

#[tokio::test]
async fn two_engines_open_and_close() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let acceptor = tokio::spawn(async move {
        let mut connection = Connection::builder()
            .container_id("server")
            .max_frame_size(4096)
            .accept_with_stream(server)
            .await
            .unwrap();
        assert_eq!(connection.max_frame_size(), 2048);
        connection.on_close().await
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .max_frame_size(2048)
        .open_with_stream(client)
        .await
        .unwrap();
    assert_eq!(connection.max_frame_size(), 2048);
    connection.close().await.unwrap();

    acceptor.await.unwrap().unwrap();
}

#[tokio::test]
async fn remote_offer_below_minimum_fails_open() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 300, None)).await;
        peer.recv().await
    });

    let result = Connection::open_with_stream("client", client).await;
    assert!(matches!(
        result,
        Err(OpenError::InvalidNegotiation {
            max_frame_size: 300
        })
    ));

    match peer.await.unwrap() {
        FrameBody::Close(Close { error: Some(error) }) => assert_eq!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::InvalidField)
        ),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn version_mismatch_fails_open() {
    let (client, mut server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        server.write_all(b"AMQP\x00\x02\x00\x00").await.unwrap();
        header
    });

    let result = Connection::open_with_stream("client", client).await;
    match result {
        Err(OpenError::VersionMismatch { found, .. }) => {
            assert_eq!(&found, b"AMQP\x00\x02\x00\x00")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(&peer.await.unwrap(), b"AMQP\x00\x01\x00\x00");
}

/// Writes a token and waits for the peer to echo it
#[derive(Debug)]
struct Token(&'static [u8]);

impl SaslNegotiator for Token {
    async fn negotiate<Io>(&mut self, io: &mut Io) -> Result<(), SaslError>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        io.write_all(self.0).await?;
        let mut echo = vec![0u8; self.0.len()];
        io.read_exact(&mut echo).await?;
        match echo == self.0 {
            true => Ok(()),
            false => Err(SaslError::Failed("token rejected".to_string())),
        }
    }
}

async fn sasl_peer(mut io: tokio::io::DuplexStream, answer: &'static [u8]) -> tokio::io::DuplexStream {
    let mut state = ConnectionState::Start;
    accept_negotiation(&mut io, &mut state, ProtocolHeader::sasl())
        .await
        .unwrap();
    let mut token = vec![0u8; answer.len()];
    io.read_exact(&mut token).await.unwrap();
    io.write_all(answer).await.unwrap();
    io
}

#[tokio::test]
async fn sasl_runs_before_the_amqp_header() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let io = sasl_peer(server, b"secret").await;
        let mut peer = RawPeer::accept(io).await;
        peer.exchange_open(open("peer", 1024, None)).await;
        peer
    });

    let connection = Connection::builder()
        .container_id("client")
        .sasl(Token(b"secret"))
        .open_with_stream(client)
        .await
        .unwrap();
    let _peer = peer.await.unwrap();
    assert_eq!(connection.max_frame_size(), 1024);
}

#[tokio::test]
async fn failed_sasl_aborts_open() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move { sasl_peer(server, b"nope!!").await });

    let result = Connection::builder()
        .container_id("client")
        .sasl(Token(b"secret"))
        .open_with_stream(client)
        .await;
    assert!(matches!(result, Err(OpenError::Sasl(SaslError::Failed(_)))));
    let _io = peer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, Some(1000))).await;
        // Heartbeats are skipped, only the Close comes through
        peer.recv().await
    });

    let mut connection = Connection::open_with_stream("client", client)
        .await
        .unwrap();
    let start = tokio::time::Instant::now();

    let result = connection.on_close().await;
    assert!(matches!(result, Err(connection::Error::ConnectionTimeout)));
    assert!(start.elapsed() >= Duration::from_millis(2000));

    match peer.await.unwrap() {
        FrameBody::Close(Close { error: Some(error) }) => assert_eq!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded)
        ),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_the_peer_alive() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, Some(1000))).await;
        let mut empty = 0;
        while empty < 3 {
            let frame = futures_util::StreamExt::next(&mut peer.transport)
                .await
                .unwrap()
                .unwrap();
            if let FrameBody::Empty = frame.body() {
                empty += 1;
                // Answer so the engine's deadline does not fire
                peer.send(0, FrameBody::Empty).await;
            }
        }
        peer
    });

    let connection = Connection::open_with_stream("client", client)
        .await
        .unwrap();
    let _peer = peer.await.unwrap();
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn oversized_frame_closes_with_framing_error_and_ends_sessions() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, None)).await;

        let begin = match peer.recv().await {
            FrameBody::Begin(begin) => begin,
            other => panic!("expected Begin, found {:?}", other),
        };
        assert_eq!(begin.remote_channel, None);
        peer.send(
            0,
            FrameBody::Begin(Begin {
                remote_channel: Some(0),
                ..begin
            }),
        )
        .await;

        // 2 KiB in one frame against a 1 KiB limit
        let big = Close {
            error: Some(definitions::Error::new(
                AmqpError::InternalError,
                Some("x".repeat(2048)),
            )),
        };
        peer.send(0, FrameBody::Close(big)).await;
        peer.recv().await
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .max_frame_size(1024)
        .open_with_stream(client)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let result = connection.on_close().await;
    match result {
        Err(connection::Error::FramingError { max_frame_size, .. }) => {
            assert_eq!(max_frame_size, 1024)
        }
        other => panic!("unexpected {:?}", other),
    }

    match session.on_end().await {
        Err(session::Error::ConnectionClosed(Some(error))) => assert_eq!(
            error.condition,
            ErrorCondition::ConnectionError(ConnectionError::FramingError)
        ),
        other => panic!("unexpected {:?}", other),
    }

    match peer.await.unwrap() {
        FrameBody::Close(Close { error: Some(error) }) => assert_eq!(
            error.condition,
            ErrorCondition::ConnectionError(ConnectionError::FramingError)
        ),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn remote_close_with_error_is_reported() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, None)).await;
        let error = definitions::Error::new(AmqpError::NotImplemented, None);
        peer.send(0, FrameBody::Close(Close { error: Some(error) }))
            .await;
        peer.recv().await
    });

    let mut connection = Connection::open_with_stream("client", client)
        .await
        .unwrap();
    match connection.on_close().await {
        Err(connection::Error::Remote(error)) => assert_eq!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::NotImplemented)
        ),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(peer.await.unwrap(), FrameBody::Close(Close { error: None })));
}

#[tokio::test]
async fn remote_session_is_accepted_and_ended() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, None)).await;
        peer.send(
            3,
            FrameBody::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: 100,
                outgoing_window: 100,
                handle_max: definitions::Handle(7),
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        )
        .await;

        let reply = peer.recv_frame().await;
        let channel = reply.channel();
        match reply.into_body() {
            FrameBody::Begin(begin) => assert_eq!(begin.remote_channel, Some(3)),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(peer.recv().await, FrameBody::End(End { error: None })));
        peer.send(3, FrameBody::End(End { error: None })).await;
        channel
    });

    let mut connection = Connection::open_with_stream("client", client)
        .await
        .unwrap();
    let mut session = connection.accept_session().await.unwrap();
    session.end().await.unwrap();

    assert_eq!(peer.await.unwrap(), 0);
}

#[tokio::test]
async fn close_during_open_is_echoed_and_fails_open() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        assert!(matches!(peer.recv().await, FrameBody::Open(_)));
        let error = definitions::Error::new(AmqpError::NotAllowed, None);
        peer.send(0, FrameBody::Close(Close { error: Some(error) }))
            .await;
        peer.recv().await
    });

    let result = Connection::open_with_stream("client", client).await;
    match result {
        Err(OpenError::RemoteClosed(Some(error))) => assert_eq!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::NotAllowed)
        ),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(peer.await.unwrap(), FrameBody::Close(Close { error: None })));
}

#[tokio::test(start_paused = true)]
async fn peer_silent_after_header_fails_open() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        assert!(matches!(peer.recv().await, FrameBody::Open(_)));
        // No Open in return
        peer
    });

    let start = tokio::time::Instant::now();
    let result = Connection::builder()
        .container_id("client")
        .open_timeout(Duration::from_secs(5))
        .open_with_stream(client)
        .await;
    assert!(matches!(result, Err(OpenError::ConnectionTimeout)));
    assert!(start.elapsed() >= Duration::from_secs(5));
    let _peer = peer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_close_gives_up_after_timeout() {
    let (client, server) = tokio::io::duplex(BUFFER);

    let peer = tokio::spawn(async move {
        let mut peer = RawPeer::accept(server).await;
        peer.exchange_open(open("peer", 1024, None)).await;
        assert!(matches!(peer.recv().await, FrameBody::Close(_)));
        // The Close is never echoed
        peer
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_timeout(Duration::from_secs(5))
        .open_with_stream(client)
        .await
        .unwrap();
    let result = connection.close().await;
    assert!(matches!(result, Err(connection::Error::ConnectionTimeout)));
    let _peer = peer.await.unwrap();
}
