//! Length-framed wire protocol.
//!
//! Every message is a fixed 4-byte little-endian header followed by a
//! bounded payload:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────┬────────────────┐
//! │ Byte 0   │ Byte 1   │ Bytes 2-3   │ Bytes 4..N     │
//! │ Type     │ Flags    │ Length      │ Payload        │
//! │ (u8)     │ (u8)     │ (u16 LE)    │ (≤ 2048 B)     │
//! └──────────┴──────────┴─────────────┴────────────────┘
//! ```
//!
//! `AUDIO` payloads are raw 16-bit LE signed mono PCM at 16 kHz. The first
//! exchange is a `START` from the caller carrying its display name; the
//! callee replies `PONG` (auto-answered), `RING` (waiting for a local
//! answer) or `ERROR` with a reason byte.

pub mod frame;

pub use frame::{encode_frame, encode_into, read_frame, Frame, FrameHeader};

use std::time::Duration;

/// Default TCP port for intercom endpoints.
pub const INTERCOM_PORT: u16 = 6054;

/// Protocol version (not carried on the wire yet; bump on layout changes).
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload an endpoint will emit.
pub const MAX_PAYLOAD: usize = 2048;

/// Receive-side payload capacity. Slightly above [`MAX_PAYLOAD`] so a peer
/// that pads its audio chunks is still accepted.
pub const RX_PAYLOAD_CAPACITY: usize = MAX_PAYLOAD + 64;

/// Largest complete frame the receive path handles.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + RX_PAYLOAD_CAPACITY;

/// Keepalive interval while connected but not streaming.
pub const PING_INTERVAL: Duration = Duration::from_millis(5000);

/// Dial timeout for outgoing connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry iterations (1 ms apart) while gathering a frame from a
/// non-blocking socket. Reset whenever any bytes arrive.
pub const RECV_RETRY_BUDGET: u32 = 50;

/// Wall-clock budget for a single framed send, partial writes included.
pub const SEND_BUDGET: Duration = Duration::from_millis(20);

/// OS socket buffer size requested for peer sockets.
pub const SOCKET_BUFFER_SIZE: usize = 32 * 1024;

/// Message types. Values are fixed for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// PCM audio data.
    Audio = 0x01,
    /// Start streaming request; payload is the caller display name.
    Start = 0x02,
    /// Stop streaming / hang up.
    Stop = 0x03,
    /// Keepalive ping.
    Ping = 0x04,
    /// Keepalive response; also ACKs a client-dial `Start`.
    Pong = 0x05,
    /// Error response; payload is one [`ReasonCode`] byte.
    Error = 0x06,
    /// Callee is ringing, waiting for a local answer.
    Ring = 0x07,
    /// Call answered; transitions a ringing peer to streaming.
    Answer = 0x08,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Audio,
            0x02 => Self::Start,
            0x03 => Self::Stop,
            0x04 => Self::Ping,
            0x05 => Self::Pong,
            0x06 => Self::Error,
            0x07 => Self::Ring,
            0x08 => Self::Answer,
            _ => return None,
        })
    }
}

/// Message flag bits.
pub mod flags {
    pub const NONE: u8 = 0x00;
    /// Last packet of a stream (reserved).
    pub const END: u8 = 0x01;
    /// On `START`: skip ringing and stream directly. Marks the caller side
    /// of a relayed call.
    pub const NO_RING: u8 = 0x02;
}

/// Reason codes carried in `ERROR` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    Ok = 0x00,
    /// Already in a call with another peer.
    Busy = 0x01,
    /// Malformed or oversize message.
    InvalidMsg = 0x02,
    /// Endpoint not ready to take calls.
    NotReady = 0x03,
    Internal = 0xFF,
}

impl ReasonCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Ok,
            0x01 => Self::Busy,
            0x02 => Self::InvalidMsg,
            0x03 => Self::NotReady,
            0xFF => Self::Internal,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Busy => "busy",
            Self::InvalidMsg => "invalid_msg",
            Self::NotReady => "not_ready",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for value in 0x01..=0x08u8 {
            let ty = MessageType::from_u8(value).unwrap();
            assert_eq!(ty as u8, value);
        }
        assert!(MessageType::from_u8(0x00).is_none());
        assert!(MessageType::from_u8(0x09).is_none());
    }

    #[test]
    fn reason_codes_match_wire_values() {
        assert_eq!(ReasonCode::Busy as u8, 0x01);
        assert_eq!(ReasonCode::Internal as u8, 0xFF);
        assert_eq!(ReasonCode::from_u8(0xFF), Some(ReasonCode::Internal));
        assert!(ReasonCode::from_u8(0x04).is_none());
    }
}
