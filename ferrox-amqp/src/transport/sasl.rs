//! Opaque SASL pre-phase
//!
//! The security layer runs over the raw stream after both peers exchanged the
//! SASL protocol header and before the AMQP header. Mechanisms are supplied by
//! the application; the engine only needs to know whether it succeeded.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

/// Error of the SASL pre-phase
#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    /// Io error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The mechanism reported a failed authentication
    #[error("SASL negotiation failed: {0}")]
    Failed(String),
}

/// Runs a SASL mechanism over the raw stream
pub trait SaslNegotiator {
    /// Drives the exchange to completion, returning `Ok(())` on success
    fn negotiate<Io>(&mut self, io: &mut Io) -> impl Future<Output = Result<(), SaslError>> + Send
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send;
}

/// Marker for connections without a security layer
#[derive(Debug)]
pub enum NoSasl {}

impl SaslNegotiator for NoSasl {
    #[allow(clippy::manual_async_fn)]
    fn negotiate<Io>(&mut self, _io: &mut Io) -> impl Future<Output = Result<(), SaslError>> + Send
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async move { match *self {} }
    }
}
