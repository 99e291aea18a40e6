use ferrox_amqp_types::definitions;

/// Errors of a session that ended or could not be used
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The session is not in a state that allows the operation
    #[error("Illegal session state")]
    IllegalState,

    /// We ended the session because the peer violated the protocol
    #[error("Local error {:?}", .0)]
    LocalError(definitions::Error),

    /// The peer ended the session with an error
    #[error("Remote error {:?}", .0)]
    RemoteError(definitions::Error),

    /// The connection closed underneath the session
    #[error("Connection closed {:?}", .0)]
    ConnectionClosed(Option<definitions::Error>),
}

/// Errors of a Begin
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BeginError {
    /// The connection is not open
    #[error("Illegal connection state")]
    IllegalConnectionState,

    /// Every channel up to channel-max is in use
    #[error("All channels have been allocated")]
    ChannelMaxReached,

    /// The peer answered the Begin with an End
    #[error("Remote ended the session {:?}", .0)]
    RemoteEnded(Option<definitions::Error>),

    /// The connection closed before the Begin was answered
    #[error("Connection closed {:?}", .0)]
    ConnectionClosed(Option<definitions::Error>),
}
