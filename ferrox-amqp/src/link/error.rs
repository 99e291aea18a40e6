use ferrox_amqp_types::definitions::{self, ErrorCondition};

/// Condition reported to callers whose link went away without a peer error
pub const ERR_LINK_DETACHED: &str = "amqp:link:detached";

/// Condition reported to callers whose session ended without a peer error
pub const ERR_SESSION_CLOSED: &str = "amqp:session:closed";

/// Condition reported to callers whose connection closed without a peer error
pub const ERR_CONNECTION_CLOSED: &str = "amqp:connection:closed";

/// Why a link can no longer be used
///
/// The wrapped error is the condition carried by the Detach, End or Close
/// that tore the link down, if there was one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The link was detached
    #[error("Link detached {0:?}")]
    Detached(Option<definitions::Error>),

    /// The session owning the link ended
    #[error("Session closed {0:?}")]
    SessionClosed(Option<definitions::Error>),

    /// The connection owning the link closed
    #[error("Connection closed {0:?}")]
    ConnectionClosed(Option<definitions::Error>),
}

impl Error {
    /// The error carried by the teardown, if any
    pub fn error(&self) -> Option<&definitions::Error> {
        match self {
            Error::Detached(error) | Error::SessionClosed(error) | Error::ConnectionClosed(error) => {
                error.as_ref()
            }
        }
    }

    /// The condition of the teardown error, or the generic condition of the
    /// scope that went away
    pub fn condition(&self) -> ErrorCondition {
        match self.error() {
            Some(error) => error.condition.clone(),
            None => match self {
                Error::Detached(_) => ErrorCondition::from(ERR_LINK_DETACHED),
                Error::SessionClosed(_) => ErrorCondition::from(ERR_SESSION_CLOSED),
                Error::ConnectionClosed(_) => ErrorCondition::from(ERR_CONNECTION_CLOSED),
            },
        }
    }
}

/// Errors of a send
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    /// The link was detached before the delivery was settled
    #[error("Link detached {0:?}")]
    Detached(Option<definitions::Error>),

    /// The session ended before the delivery was settled
    #[error("Session closed {0:?}")]
    SessionClosed(Option<definitions::Error>),

    /// The connection closed before the delivery was settled
    #[error("Connection closed {0:?}")]
    ConnectionClosed(Option<definitions::Error>),

    /// The payload is larger than the peer accepts on this link
    #[error("Message of {size} bytes exceeds the max-message-size of {max_message_size}")]
    MessageSizeExceeded {
        /// Size of the rejected payload
        size: usize,
        /// Limit announced by the peer
        max_message_size: u64,
    },
}

impl From<Error> for SendError {
    fn from(err: Error) -> Self {
        match err {
            Error::Detached(error) => SendError::Detached(error),
            Error::SessionClosed(error) => SendError::SessionClosed(error),
            Error::ConnectionClosed(error) => SendError::ConnectionClosed(error),
        }
    }
}

/// Errors of an attach
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttachError {
    /// The session is not mapped
    #[error("Illegal session state")]
    IllegalSessionState,

    /// Link names are unique per session and direction
    #[error("Link name {0:?} is already in use")]
    DuplicatedLinkName(String),

    /// Every handle up to handle-max is in use
    #[error("Handle max reached")]
    HandleMaxReached,

    /// The peer answered without a terminus and detached
    #[error("Attach refused {0:?}")]
    Refused(Option<definitions::Error>),

    /// The session or connection went away before the attach completed
    #[error(transparent)]
    Link(#[from] Error),
}

#[cfg(test)]
mod tests {
    use ferrox_amqp_types::definitions::{LinkError, SessionError};

    use super::*;

    #[test]
    fn teardown_without_peer_error_reports_the_scope_condition() {
        assert_eq!(
            Error::Detached(None).condition(),
            ErrorCondition::from(ERR_LINK_DETACHED)
        );
        assert_eq!(
            Error::SessionClosed(None).condition().as_str(),
            "amqp:session:closed"
        );
    }

    #[test]
    fn teardown_with_peer_error_reports_it_verbatim() {
        let error = definitions::Error::new(LinkError::DetachForced, Some("bye".to_string()));
        let err = Error::Detached(Some(error.clone()));
        assert_eq!(err.condition(), ErrorCondition::LinkError(LinkError::DetachForced));
        assert_eq!(err.error(), Some(&error));

        let err = SendError::from(Error::SessionClosed(Some(SessionError::WindowViolation.into())));
        assert!(matches!(err, SendError::SessionClosed(Some(_))));
    }
}
