//! Frame encoding and framed receive over non-blocking sockets.
//!
//! The receive path must tolerate arbitrary TCP segmentation: a frame may
//! arrive in any number of pieces, down to one byte at a time. The reader
//! loops over `read`, sleeping briefly on `WouldBlock`, and resets its retry
//! budget whenever it makes progress.

use bytes::Bytes;
use std::io::{self, Read};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use super::{MessageType, HEADER_LEN, MAX_PAYLOAD, RECV_RETRY_BUDGET, RX_PAYLOAD_CAPACITY};
use crate::error::ProtocolError;

/// Fixed 4-byte little-endian message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u8,
    pub flags: u8,
    pub length: u16,
}

impl FrameHeader {
    pub fn new(msg_type: MessageType, flags: u8, length: u16) -> Self {
        Self {
            msg_type: msg_type as u8,
            flags,
            length,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_le_bytes();
        [self.msg_type, self.flags, len[0], len[1]]
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            msg_type: bytes[0],
            flags: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Parsed message type, `None` for unknown values (logged and ignored
    /// by the caller for forward compatibility).
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }
}

/// One decoded wire message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }
}

/// Encode a complete frame into a fresh buffer.
///
/// Rejects payloads above [`MAX_PAYLOAD`].
pub fn encode_frame(
    msg_type: MessageType,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(&mut buf, msg_type, flags, payload)?;
    Ok(buf)
}

/// Encode into a reusable staging buffer. The buffer is cleared first.
pub fn encode_into(
    buf: &mut Vec<u8>,
    msg_type: MessageType,
    flags: u8,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    buf.clear();
    buf.extend_from_slice(&FrameHeader::new(msg_type, flags, payload.len() as u16).to_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Read exactly `buf.len()` bytes from a non-blocking stream.
///
/// Sleeps 1 ms on `WouldBlock`; gives up after [`RECV_RETRY_BUDGET`]
/// consecutive empty reads. Any progress resets the budget.
fn read_exact_retry(mut stream: &TcpStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    let mut retries = 0u32;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(ProtocolError::Closed),
            Ok(n) => {
                filled += n;
                retries = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries >= RECV_RETRY_BUDGET {
                    return Err(ProtocolError::Incomplete);
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(())
}

/// Receive one complete frame from a non-blocking stream.
///
/// `scratch` must hold at least [`RX_PAYLOAD_CAPACITY`] bytes; an announced
/// length above that capacity is [`ProtocolError::Oversize`] and the caller
/// is expected to close the peer.
pub fn read_frame(stream: &TcpStream, scratch: &mut [u8]) -> Result<Frame, ProtocolError> {
    debug_assert!(scratch.len() >= RX_PAYLOAD_CAPACITY);

    let mut header_bytes = [0u8; HEADER_LEN];
    read_exact_retry(stream, &mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let length = header.length as usize;
    if length > scratch.len() {
        return Err(ProtocolError::Oversize(length));
    }

    if length > 0 {
        read_exact_retry(stream, &mut scratch[..length])?;
    }

    Ok(Frame {
        header,
        payload: Bytes::copy_from_slice(&scratch[..length]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;
    use std::io::Write;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(MessageType::Start, flags::NO_RING, 512);
        let decoded = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.message_type(), Some(MessageType::Start));
    }

    #[test]
    fn header_is_little_endian() {
        let header = FrameHeader::new(MessageType::Audio, 0, 0x0201);
        assert_eq!(header.to_bytes(), [0x01, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = encode_frame(MessageType::Audio, flags::NONE, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge(n) if n == MAX_PAYLOAD + 1));
    }

    #[test]
    fn encode_decode_round_trip_over_socket() {
        let (mut client, server) = loopback_pair();
        let payload: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        let encoded = encode_frame(MessageType::Audio, flags::END, &payload).unwrap();
        client.write_all(&encoded).unwrap();

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let frame = read_frame(&server, &mut scratch).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::Audio));
        assert_eq!(frame.header.flags, flags::END);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn decoder_survives_byte_by_byte_delivery() {
        let (mut client, server) = loopback_pair();
        let encoded = encode_frame(MessageType::Start, flags::NONE, b"caller").unwrap();

        let writer = std::thread::spawn(move || {
            for byte in encoded {
                client.write_all(&[byte]).unwrap();
                client.flush().unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let frame = read_frame(&server, &mut scratch).unwrap();
        writer.join().unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::Start));
        assert_eq!(&frame.payload[..], b"caller");
    }

    #[test]
    fn clean_eof_is_closed() {
        let (client, server) = loopback_pair();
        drop(client);
        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let err = read_frame(&server, &mut scratch).unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[test]
    fn eof_mid_frame_is_closed() {
        let (mut client, server) = loopback_pair();
        let encoded = encode_frame(MessageType::Audio, flags::NONE, &[1, 2, 3, 4]).unwrap();
        client.write_all(&encoded[..5]).unwrap();
        drop(client);

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let err = read_frame(&server, &mut scratch).unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[test]
    fn stalled_peer_exhausts_budget() {
        let (mut client, server) = loopback_pair();
        // Header promises a payload that never arrives.
        let header = FrameHeader::new(MessageType::Audio, flags::NONE, 64);
        client.write_all(&header.to_bytes()).unwrap();

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let err = read_frame(&server, &mut scratch).unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete));
        drop(client);
    }

    #[test]
    fn oversize_length_is_rejected() {
        let (mut client, server) = loopback_pair();
        let header = FrameHeader {
            msg_type: MessageType::Audio as u8,
            flags: 0,
            length: (RX_PAYLOAD_CAPACITY + 1) as u16,
        };
        client.write_all(&header.to_bytes()).unwrap();

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let err = read_frame(&server, &mut scratch).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversize(n) if n == RX_PAYLOAD_CAPACITY + 1));
    }

    #[test]
    fn empty_payload_frame() {
        let (mut client, server) = loopback_pair();
        let encoded = encode_frame(MessageType::Ping, flags::NONE, &[]).unwrap();
        client.write_all(&encoded).unwrap();

        let mut scratch = vec![0u8; RX_PAYLOAD_CAPACITY];
        let frame = read_frame(&server, &mut scratch).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::Ping));
        assert!(frame.payload.is_empty());
    }
}
