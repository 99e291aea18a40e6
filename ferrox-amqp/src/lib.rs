#![deny(missing_debug_implementations)]

//! An AMQP 1.0 transport engine
//!
//! The engine negotiates a connection over any duplex byte stream,
//! multiplexes sessions over its channels and moves deliveries across links
//! with credit based flow control.
//!
//! Each connection is driven by a single dispatch task. The state machines
//! of the three tiers ([`connection`], [`session`] and [`link`]) are plain
//! structs owned by that task; the application talks to them through
//! handles that exchange commands and events over channels.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use ferrox_amqp::{Connection, Receiver, Sender, Session};
//!
//! # async fn run<Io>(stream: Io) -> Result<(), Box<dyn std::error::Error>>
//! # where
//! #     Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
//! # {
//! let mut connection = Connection::builder()
//!     .container_id("client")
//!     .max_frame_size(1024 * 16)
//!     .open_with_stream(stream)
//!     .await?;
//! let mut session = Session::begin(&mut connection).await?;
//!
//! let mut sender = Sender::attach(&mut session, "sender-link-1", "q1").await?;
//! let outcome = sender.send(&b"hello AMQP"[..]).await?;
//! println!("{:?}", outcome);
//!
//! let mut receiver = Receiver::attach(&mut session, "receiver-link-1", "q1").await?;
//! let delivery = receiver.recv().await?;
//! receiver.accept(&delivery).await?;
//!
//! sender.close().await?;
//! receiver.close().await?;
//! session.end().await?;
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
mod control;
pub mod error;
pub mod frames;
pub mod link;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionHandle};
pub use link::{Delivery, DeliveryOutcome, Receiver, Sendable, Sender};
pub use session::{Session, SessionHandle};

pub use ferrox_amqp_types as types;

/// Message bytes carried by transfers
///
/// The engine never looks inside; message encoding belongs to the layer above.
pub type Payload = bytes::Bytes;
