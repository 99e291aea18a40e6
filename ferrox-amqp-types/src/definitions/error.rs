use std::fmt;

use serde::{de, ser, Deserialize, Serialize};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::Symbol,
};

use super::Fields;

/// Details of an error
///
/// <type name="error" class="composite" source="list">
///     <descriptor name="amqp:error:list" code="0x00000000:0x0000001d"/>
/// </type>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:error:list",
    code = "0x0000_0000:0x0000_001d",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Error {
    /// A symbolic value indicating the error condition
    pub condition: ErrorCondition,

    /// Descriptive text about the error condition
    pub description: Option<String>,

    /// Map carrying information about the error condition
    pub info: Option<Fields>,
}

impl Error {
    /// Creates a new error
    pub fn new(
        condition: impl Into<ErrorCondition>,
        description: impl Into<Option<String>>,
    ) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
            info: None,
        }
    }
}

impl<T> From<T> for Error
where
    T: Into<ErrorCondition>,
{
    fn from(condition: T) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl std::error::Error for Error {}

/// The symbolic condition carried by an [`Error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    /// Shared error conditions
    AmqpError(AmqpError),
    /// Connection-scoped conditions
    ConnectionError(ConnectionError),
    /// Session-scoped conditions
    SessionError(SessionError),
    /// Link-scoped conditions
    LinkError(LinkError),
    /// Any condition not defined by the core protocol
    Custom(Symbol),
}

impl ErrorCondition {
    /// The AMQP symbol of this condition
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCondition::AmqpError(c) => c.as_str(),
            ErrorCondition::ConnectionError(c) => c.as_str(),
            ErrorCondition::SessionError(c) => c.as_str(),
            ErrorCondition::LinkError(c) => c.as_str(),
            ErrorCondition::Custom(c) => c.as_str(),
        }
    }
}

impl From<&str> for ErrorCondition {
    fn from(value: &str) -> Self {
        if let Ok(c) = AmqpError::try_from(value) {
            return ErrorCondition::AmqpError(c);
        }
        if let Ok(c) = ConnectionError::try_from(value) {
            return ErrorCondition::ConnectionError(c);
        }
        if let Ok(c) = SessionError::try_from(value) {
            return ErrorCondition::SessionError(c);
        }
        if let Ok(c) = LinkError::try_from(value) {
            return ErrorCondition::LinkError(c);
        }
        ErrorCondition::Custom(Symbol::from(value))
    }
}

impl From<AmqpError> for ErrorCondition {
    fn from(value: AmqpError) -> Self {
        ErrorCondition::AmqpError(value)
    }
}

impl From<ConnectionError> for ErrorCondition {
    fn from(value: ConnectionError) -> Self {
        ErrorCondition::ConnectionError(value)
    }
}

impl From<SessionError> for ErrorCondition {
    fn from(value: SessionError) -> Self {
        ErrorCondition::SessionError(value)
    }
}

impl From<LinkError> for ErrorCondition {
    fn from(value: LinkError) -> Self {
        ErrorCondition::LinkError(value)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ser::Serialize for ErrorCondition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ErrorCondition::AmqpError(c) => c.serialize(serializer),
            ErrorCondition::ConnectionError(c) => c.serialize(serializer),
            ErrorCondition::SessionError(c) => c.serialize(serializer),
            ErrorCondition::LinkError(c) => c.serialize(serializer),
            ErrorCondition::Custom(c) => c.serialize(serializer),
        }
    }
}

impl<'de> de::Deserialize<'de> for ErrorCondition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let symbol = Symbol::deserialize(deserializer)?;
        Ok(ErrorCondition::from(symbol.as_str()))
    }
}

symbol_enum! {
    /// Shared error conditions
    pub enum AmqpError {
        /// An internal error occurred
        InternalError = "amqp:internal-error",
        /// A peer attempted to work with a remote entity that does not exist
        NotFound = "amqp:not-found",
        /// A peer attempted to work with a remote entity to which it has no access
        UnauthorizedAccess = "amqp:unauthorized-access",
        /// Data could not be decoded
        DecodeError = "amqp:decode-error",
        /// A peer exceeded its resource allocation
        ResourceLimitExceeded = "amqp:resource-limit-exceeded",
        /// The peer tried to use a frame in a manner that is inconsistent with the protocol
        NotAllowed = "amqp:not-allowed",
        /// An invalid field was passed in a frame body
        InvalidField = "amqp:invalid-field",
        /// The peer tried to use functionality that is not implemented
        NotImplemented = "amqp:not-implemented",
        /// The client attempted to work with a server entity to which it has no access
        ResourceLocked = "amqp:resource-locked",
        /// The client made a request that was not allowed because some precondition failed
        PreconditionFailed = "amqp:precondition-failed",
        /// A server entity the client is working with has been deleted
        ResourceDeleted = "amqp:resource-deleted",
        /// The peer sent a frame that is not permitted in the current state
        IllegalState = "amqp:illegal-state",
        /// The peer cannot send a frame because the smallest encoding does not fit
        FrameSizeTooSmall = "amqp:frame-size-too-small",
    }
}

symbol_enum! {
    /// Connection-scoped error conditions
    pub enum ConnectionError {
        /// An operator intervened to close the connection for some reason
        ConnectionForced = "amqp:connection:forced",
        /// A valid frame header cannot be formed from the incoming byte stream
        FramingError = "amqp:connection:framing-error",
        /// The container is no longer available on the current connection
        Redirect = "amqp:connection:redirect",
    }
}

symbol_enum! {
    /// Session-scoped error conditions
    pub enum SessionError {
        /// The peer violated incoming window for the session
        WindowViolation = "amqp:session:window-violation",
        /// Input was received for a link that was detached with an error
        ErrantLink = "amqp:session:errant-link",
        /// An attach was received using a handle that is already in use
        HandleInUse = "amqp:session:handle-in-use",
        /// A frame (other than attach) was received referencing a handle which
        /// is not currently in use
        UnattachedHandle = "amqp:session:unattached-handle",
    }
}

symbol_enum! {
    /// Link-scoped error conditions
    pub enum LinkError {
        /// An operator intervened to detach for some reason
        DetachForced = "amqp:link:detach-forced",
        /// The peer sent more message transfers than currently allowed on the link
        TransferLimitExceeded = "amqp:link:transfer-limit-exceeded",
        /// The peer sent a larger message than is supported on the link
        MessageSizeExceeded = "amqp:link:message-size-exceeded",
        /// The address provided cannot be resolved to a terminus at the current container
        Redirect = "amqp:link:redirect",
        /// The link has been attached elsewhere
        Stolen = "amqp:link:stolen",
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::{format_code::EncodingCodes, from_slice, to_vec};

    use super::*;

    #[test]
    fn decode_known_condition_symbol() {
        let symbol = b"amqp:decode-error";
        let mut buf = vec![EncodingCodes::Sym8 as u8, symbol.len() as u8];
        buf.extend_from_slice(symbol);

        let condition: ErrorCondition = from_slice(&buf).unwrap();
        assert_eq!(condition, ErrorCondition::AmqpError(AmqpError::DecodeError));
    }

    #[test]
    fn unknown_condition_is_kept_verbatim() {
        let condition = ErrorCondition::from("com.example:custom");
        assert_eq!(
            condition,
            ErrorCondition::Custom(Symbol::from("com.example:custom"))
        );
        assert_eq!(condition.as_str(), "com.example:custom");
    }

    #[test]
    fn error_keeps_condition_and_description() {
        let expected = Error::new(
            SessionError::WindowViolation,
            Some(String::from("incoming window is 0")),
        );
        let buf = to_vec(&expected).unwrap();
        let decoded: Error = from_slice(&buf).unwrap();
        assert_eq!(decoded, expected);
        assert_eq!(
            decoded.to_string(),
            "amqp:session:window-violation: incoming window is 0"
        );
    }
}
