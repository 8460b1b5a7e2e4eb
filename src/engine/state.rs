//! Call state machine types and engine events.

use std::fmt;

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

/// User-visible call state. `Idle` is both the initial and the terminal
/// state of every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress.
    Idle,
    /// We initiated a call and wait for the remote side to answer.
    Outgoing,
    /// Someone is calling us, before ringing starts.
    Incoming,
    /// Actively ringing, waiting for a local or remote answer.
    Ringing,
    /// Answer accepted, stream being set up.
    Answering,
    /// Audio flowing both ways.
    Streaming,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Ringing => "ringing",
            Self::Answering => "answering",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    None,
    LocalHangup,
    RemoteHangup,
    Declined,
    Timeout,
    Busy,
    Unreachable,
    ProtocolError,
    BridgeError,
}

impl CallEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::LocalHangup => "local_hangup",
            Self::RemoteHangup => "remote_hangup",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Unreachable => "unreachable",
            Self::ProtocolError => "protocol_error",
            Self::BridgeError => "bridge_error",
        }
    }

    /// Failure-class reasons surface as [`CallEvent::CallFailed`]; the rest
    /// as [`CallEvent::Hangup`].
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Unreachable | Self::Busy | Self::ProtocolError | Self::BridgeError
        )
    }
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted on every FSM edge, delivered through the engine's event
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    IncomingCall,
    OutgoingCall,
    Ringing,
    Answered,
    Streaming,
    Hangup(CallEndReason),
    CallFailed(CallEndReason),
    Idle,
    /// Publishable string form of the new call state.
    State(CallState),
    /// Display name of the remote caller; empty when the call ends.
    Caller(String),
    /// Currently selected call destination.
    Destination(String),
}
