use ferrox_amqp_types::definitions::TransferNumber;
use tokio::sync::oneshot;

use crate::{connection::ConnectionHandle, control::ConnectionControl};

use super::{BeginError, SessionConfig, SessionHandle, DEFAULT_HANDLE_MAX, DEFAULT_WINDOW};

/// Builder for a [`Session`](super::Session)
///
/// ```rust,ignore
/// let mut session = Session::builder()
///     .incoming_window(128)
///     .handle_max(16)
///     .begin(&mut connection)
///     .await
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    /// The transfer-id of the first transfer we send
    pub next_outgoing_id: TransferNumber,

    /// Transfers we accept before granting more
    pub incoming_window: u32,

    /// Transfers we send before waiting for a Flow
    pub outgoing_window: u32,

    /// Largest link handle we use and accept
    pub handle_max: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default windows and handle-max
    pub fn new() -> Self {
        Self {
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: DEFAULT_HANDLE_MAX,
        }
    }

    /// The transfer-id of the first transfer we send
    pub fn next_outgoing_id(mut self, value: TransferNumber) -> Self {
        self.next_outgoing_id = value;
        self
    }

    /// Sets the incoming window
    pub fn incoming_window(mut self, value: u32) -> Self {
        self.incoming_window = value;
        self
    }

    /// Sets the outgoing window
    pub fn outgoing_window(mut self, value: u32) -> Self {
        self.outgoing_window = value;
        self
    }

    /// Sets the handle-max
    pub fn handle_max(mut self, value: u32) -> Self {
        self.handle_max = value;
        self
    }

    pub(crate) fn into_config(self) -> SessionConfig {
        SessionConfig {
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max,
        }
    }

    /// Begins the session on the connection and waits for the peer's Begin
    pub async fn begin(self, connection: &mut ConnectionHandle) -> Result<SessionHandle, BeginError> {
        let control = connection.control.clone();
        let (responder, result) = oneshot::channel();
        control
            .send(ConnectionControl::Begin {
                config: self.into_config(),
                responder,
            })
            .await
            .map_err(|_| BeginError::IllegalConnectionState)?;
        let relay = result
            .await
            .map_err(|_| BeginError::ConnectionClosed(None))??;
        Ok(SessionHandle::new(relay, control))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = Builder::new().into_config();
        assert_eq!(config, SessionConfig::default());

        let config = Builder::new()
            .incoming_window(10)
            .outgoing_window(20)
            .handle_max(3)
            .into_config();
        assert_eq!(config.incoming_window, 10);
        assert_eq!(config.outgoing_window, 20);
        assert_eq!(config.handle_max, 3);
    }
}
