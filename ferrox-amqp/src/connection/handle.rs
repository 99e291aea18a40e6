use ferrox_amqp_types::definitions;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    control::ConnectionControl,
    session::{SessionHandle, SessionRelay},
};

use super::Error;

/// A handle to a connection whose dispatch loop runs in its own task
///
/// Sessions are begun on the handle. Dropping it without calling
/// [`close`](ConnectionHandle::close) closes the connection once the
/// sessions and links begun on it are gone too.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub(crate) control: mpsc::Sender<ConnectionControl>,
    handle: Option<JoinHandle<Result<(), Error>>>,
    incoming_sessions: mpsc::UnboundedReceiver<SessionRelay>,
    max_frame_size: usize,
}

impl ConnectionHandle {
    pub(crate) fn new(
        control: mpsc::Sender<ConnectionControl>,
        handle: JoinHandle<Result<(), Error>>,
        incoming_sessions: mpsc::UnboundedReceiver<SessionRelay>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            control,
            handle: Some(handle),
            incoming_sessions,
            max_frame_size,
        }
    }

    /// The negotiated max-frame-size
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether the dispatch loop has stopped
    pub fn is_closed(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Close the connection and wait for the peer's Close
    pub async fn close(&mut self) -> Result<(), Error> {
        self.close_inner(None).await
    }

    /// Close the connection with an error
    pub async fn close_with_error(
        &mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        self.close_inner(Some(error.into())).await
    }

    async fn close_inner(&mut self, error: Option<definitions::Error>) -> Result<(), Error> {
        if self.handle.is_none() {
            return Err(Error::IllegalState);
        }
        // The loop may have stopped on its own, its result tells why
        let _ = self.control.send(ConnectionControl::Close { error }).await;
        self.on_close().await
    }

    /// Waits until the dispatch loop stops and returns how the connection
    /// ended
    ///
    /// Returns [`Error::IllegalState`] if the outcome was already taken.
    pub async fn on_close(&mut self) -> Result<(), Error> {
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(Error::JoinError(err)),
            },
            None => Err(Error::IllegalState),
        }
    }

    /// Waits for a session the peer begins on this connection
    ///
    /// The Begin has already been answered. Returns `None` once the
    /// connection has stopped.
    pub async fn accept_session(&mut self) -> Option<SessionHandle> {
        let relay = self.incoming_sessions.recv().await?;
        Some(SessionHandle::new(relay, self.control.clone()))
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.control.try_send(ConnectionControl::Close { error: None });
        }
    }
}
