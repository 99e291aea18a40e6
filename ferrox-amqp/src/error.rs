//! Scopes of protocol violations
//!
//! A violation detected while handling an incoming frame tears down the
//! smallest endpoint that contains it. The multiplexer inspects the scope
//! and decides whether a link is detached, a session ended or the whole
//! connection closed.

use ferrox_amqp_types::definitions::{self, AmqpError, ErrorCondition};

/// How far a protocol violation tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only the offending link is detached
    Link,

    /// The session is ended and every link on it is torn down
    Session,

    /// The connection is closed and everything on it is torn down
    Connection,
}

/// A violation together with the endpoint it concerns
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScopedError {
    /// The link under `link` key in the session that detected it
    Link {
        link: usize,
        error: definitions::Error,
    },

    /// The session that detected it
    Session(definitions::Error),

    /// The whole connection
    Connection(definitions::Error),
}

impl ScopedError {
    pub(crate) fn link(link: usize, condition: impl Into<ErrorCondition>, description: &str) -> Self {
        Self::Link {
            link,
            error: definitions::Error::new(condition, Some(description.to_string())),
        }
    }

    pub(crate) fn session(condition: impl Into<ErrorCondition>, description: &str) -> Self {
        Self::Session(definitions::Error::new(
            condition,
            Some(description.to_string()),
        ))
    }

    pub(crate) fn connection(condition: impl Into<ErrorCondition>, description: &str) -> Self {
        Self::Connection(definitions::Error::new(
            condition,
            Some(description.to_string()),
        ))
    }

    /// A performative that is not legal in the endpoint's current state
    pub(crate) fn illegal_state(description: &str) -> Self {
        Self::connection(AmqpError::IllegalState, description)
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            ScopedError::Link { .. } => ErrorScope::Link,
            ScopedError::Session(_) => ErrorScope::Session,
            ScopedError::Connection(_) => ErrorScope::Connection,
        }
    }

    pub fn error(&self) -> &definitions::Error {
        match self {
            ScopedError::Link { error, .. } => error,
            ScopedError::Session(error) => error,
            ScopedError::Connection(error) => error,
        }
    }
}
