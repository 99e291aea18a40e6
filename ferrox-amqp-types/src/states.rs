//! Endpoint states of the three protocol tiers

/// Connection states
///
/// ```text
/// START -> HDR_SENT | HDR_RCVD -> HDR_EXCH -> [OPEN_PIPE] -> OPEN_SENT | OPEN_RCVD
///       -> OPENED -> CLOSE_PIPE | CLOSE_SENT | CLOSE_RCVD -> END
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No protocol header sent or received yet
    Start,
    /// The protocol header has been received but not yet sent
    HeaderReceived,
    /// The protocol header has been sent but not yet received
    HeaderSent,
    /// Protocol headers have been sent and received
    HeaderExchange,
    /// Header and Open have been sent, nothing received yet
    OpenPipe,
    /// Header, Open and Close have been sent, nothing received yet
    OpenClosePipe,
    /// Both headers exchanged, the remote Open received but not yet sent
    OpenReceived,
    /// Both headers exchanged, Open sent but not yet received
    OpenSent,
    /// Open and Close sent, the remote Open not yet received
    ClosePipe,
    /// Open sent and received
    Opened,
    /// The remote Close received but not yet answered
    CloseReceived,
    /// Close sent, waiting for the remote Close
    CloseSent,
    /// Close with an error sent, incoming frames are discarded until the remote Close
    Discarding,
    /// No further frames may be sent or received
    End,
}

impl ConnectionState {
    /// Whether an Open has been emitted in this state
    pub fn open_sent(&self) -> bool {
        !matches!(
            self,
            ConnectionState::Start
                | ConnectionState::HeaderReceived
                | ConnectionState::HeaderSent
                | ConnectionState::HeaderExchange
                | ConnectionState::OpenReceived
        )
    }
}

/// Session states
///
/// ```text
/// UNMAPPED -> BEGIN_SENT | BEGIN_RCVD -> MAPPED -> END_SENT | END_RCVD -> DISCARDING -> UNMAPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not mapped to any channel
    Unmapped,
    /// Begin sent, waiting for the remote Begin
    BeginSent,
    /// The remote Begin received, local Begin not yet sent
    BeginReceived,
    /// Begin sent and received
    Mapped,
    /// End sent, waiting for the remote End
    EndSent,
    /// The remote End received, local End not yet sent
    EndReceived,
    /// End with an error sent, incoming frames are discarded until the remote End
    Discarding,
}

/// Link states
///
/// ```text
/// DETACHED -> ATTACH_SENT | ATTACH_RCVD -> ATTACHED -> DETACH_SENT | DETACH_RCVD -> DETACHED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not attached
    Detached,
    /// Attach sent, waiting for the remote Attach
    AttachSent,
    /// The remote Attach received, local Attach not yet sent
    AttachReceived,
    /// Attach sent and received
    Attached,
    /// Detach sent, waiting for the remote Detach
    DetachSent,
    /// The remote Detach received, local Detach not yet sent
    DetachReceived,
}
