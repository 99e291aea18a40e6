use std::time::Duration;

use ferrox_amqp::{
    link::{CreditMode, IncomingLink, SendError},
    types::{
        definitions::{self, LinkError},
        messaging::Source,
    },
    Connection, ConnectionHandle, DeliveryOutcome, Receiver, Sendable, Sender, Session,
    SessionHandle,
};

mod common;

use common::BUFFER;

struct Pair {
    client: ConnectionHandle,
    client_session: SessionHandle,
    server: ConnectionHandle,
    server_session: SessionHandle,
}

/// Two engines over an in-memory stream with one session between them
async fn pair(incoming_window: u32) -> Pair {
    let (client, server) = tokio::io::duplex(BUFFER);

    let acceptor = tokio::spawn(async move {
        let mut connection = Connection::accept_with_stream("server", server)
            .await
            .unwrap();
        let session = connection.accept_session().await.unwrap();
        (connection, session)
    });

    let mut connection = Connection::open_with_stream("client", client)
        .await
        .unwrap();
    let session = Session::builder()
        .incoming_window(incoming_window)
        .begin(&mut connection)
        .await
        .unwrap();
    let (server, server_session) = acceptor.await.unwrap();

    Pair {
        client: connection,
        client_session: session,
        server,
        server_session,
    }
}

async fn incoming_receiver(session: &mut SessionHandle) -> Receiver {
    match session.accept_link().await {
        Some(IncomingLink::Receiver(receiver)) => receiver,
        other => panic!("expected a receiver, found {:?}", other),
    }
}

async fn incoming_sender(session: &mut SessionHandle) -> Sender {
    match session.accept_link().await {
        Some(IncomingLink::Sender(sender)) => sender,
        other => panic!("expected a sender, found {:?}", other),
    }
}

#[tokio::test]
async fn send_and_accept() {
    let mut pair = pair(2048).await;

    let mut sender = Sender::attach(&mut pair.client_session, "sender-1", "q1")
        .await
        .unwrap();
    let mut receiver = incoming_receiver(&mut pair.server_session).await;
    assert_eq!(receiver.name(), "sender-1");

    let outcome = sender.send_nowait(&b"hello AMQP"[..]).await.unwrap();
    let delivery = receiver.recv().await.unwrap();
    assert_eq!(&delivery.payload()[..], b"hello AMQP");
    assert!(!delivery.is_settled());
    receiver.accept(&delivery).await.unwrap();
    assert!(outcome.await.unwrap().is_accepted());

    sender.close().await.unwrap();
    assert!(receiver.recv().await.is_err());

    pair.client_session.end().await.unwrap();
    pair.client.close().await.unwrap();
    pair.server.on_close().await.unwrap();
}

#[tokio::test]
async fn presettled_send_resolves_without_disposition() {
    let mut pair = pair(2048).await;

    let mut sender = Sender::attach(&mut pair.client_session, "sender-1", "q1")
        .await
        .unwrap();
    let mut receiver = incoming_receiver(&mut pair.server_session).await;

    let outcome = sender
        .send(Sendable::new(&b"fire and forget"[..]).settled(true))
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Settled);

    let delivery = receiver.recv().await.unwrap();
    assert!(delivery.is_settled());
}

#[tokio::test]
async fn large_message_is_split_and_reassembled() {
    let mut pair = pair(2048).await;

    let mut receiver = Receiver::attach(&mut pair.client_session, "receiver-1", "q1")
        .await
        .unwrap();
    let mut sender = incoming_sender(&mut pair.server_session).await;

    // Far above the default max-frame-size
    let payload = vec![7u8; 1024 * 1024];
    let outcome = sender.send_nowait(payload.clone()).await.unwrap();

    let delivery = receiver.recv().await.unwrap();
    assert_eq!(delivery.payload().len(), payload.len());
    assert_eq!(&delivery.payload()[..], &payload[..]);
    receiver.accept(&delivery).await.unwrap();
    assert!(outcome.await.unwrap().is_accepted());
}

#[tokio::test(start_paused = true)]
async fn manual_credit_bounds_deliveries() {
    let mut pair = pair(2048).await;

    let mut receiver = Receiver::builder()
        .name("receiver-1")
        .source(Source::with_address("q1"))
        .credit_mode(CreditMode::Manual)
        .attach(&mut pair.client_session)
        .await
        .unwrap();
    let mut sender = incoming_sender(&mut pair.server_session).await;

    let mut outcomes = Vec::new();
    for i in 0..5u8 {
        outcomes.push(sender.send_nowait(vec![i]).await.unwrap());
    }

    // Nothing flows without credit
    let idle = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await;
    assert!(idle.is_err());

    receiver.set_credit(3).await.unwrap();
    for i in 0..3u8 {
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(&delivery.payload()[..], &[i]);
        receiver.accept(&delivery).await.unwrap();
    }
    let idle = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await;
    assert!(idle.is_err());

    receiver.set_credit(2).await.unwrap();
    for i in 3..5u8 {
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(&delivery.payload()[..], &[i]);
        receiver.accept(&delivery).await.unwrap();
    }

    for outcome in outcomes {
        assert!(outcome.await.unwrap().is_accepted());
    }
}

#[tokio::test]
async fn small_session_window_is_replenished() {
    let mut pair = pair(2).await;

    let mut receiver = Receiver::attach(&mut pair.client_session, "receiver-1", "q1")
        .await
        .unwrap();
    let mut sender = incoming_sender(&mut pair.server_session).await;

    let mut outcomes = Vec::new();
    for i in 0..8u8 {
        outcomes.push(sender.send_nowait(vec![i]).await.unwrap());
    }

    for i in 0..8u8 {
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(&delivery.payload()[..], &[i]);
        receiver.accept(&delivery).await.unwrap();
    }
    for outcome in outcomes {
        assert!(outcome.await.unwrap().is_accepted());
    }
}

#[tokio::test]
async fn detach_with_error_fails_pending_sends() {
    let mut pair = pair(2048).await;

    let mut receiver = Receiver::builder()
        .name("receiver-1")
        .source(Source::with_address("q1"))
        .credit_mode(CreditMode::Manual)
        .attach(&mut pair.client_session)
        .await
        .unwrap();
    let mut sender = incoming_sender(&mut pair.server_session).await;

    // Queued for lack of credit
    let outcome = sender.send_nowait(&b"never sent"[..]).await.unwrap();

    let error = definitions::Error::new(LinkError::DetachForced, None);
    receiver.close_with_error(error.clone()).await.unwrap();

    match outcome.await {
        Err(SendError::Detached(Some(e))) => assert_eq!(e, error),
        other => panic!("unexpected {:?}", other),
    }
    let err = sender.on_detach().await;
    assert_eq!(err.error(), Some(&error));
}

#[tokio::test]
async fn ending_the_session_detaches_its_links() {
    let mut pair = pair(2048).await;

    let mut sender = Sender::attach(&mut pair.client_session, "sender-1", "q1")
        .await
        .unwrap();
    let mut receiver = incoming_receiver(&mut pair.server_session).await;

    pair.server_session.end().await.unwrap();

    assert!(receiver.recv().await.is_err());
    let err = sender.on_detach().await;
    assert!(matches!(err, ferrox_amqp::link::Error::SessionClosed(None)));
    assert!(sender.send(&b"too late"[..]).await.is_err());
}

#[tokio::test]
async fn links_attached_before_the_end_are_still_accepted() {
    let mut pair = pair(2048).await;

    let _sender = Sender::attach(&mut pair.client_session, "sender-1", "q1")
        .await
        .unwrap();
    pair.client_session.end().await.unwrap();

    pair.server_session.on_end().await.unwrap();
    let mut receiver = incoming_receiver(&mut pair.server_session).await;
    assert_eq!(receiver.name(), "sender-1");
    assert!(receiver.recv().await.is_err());
    assert!(pair.server_session.accept_link().await.is_none());
}
