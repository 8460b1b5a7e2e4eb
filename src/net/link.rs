//! One-peer TCP endpoint.
//!
//! At most one [`PeerSession`] exists at any time. All senders share one
//! mutex over a staging buffer, so frames from the control path and the TX
//! task are globally ordered on the wire. Closing swaps the session out
//! under a short lock and shuts the socket down, so no two tasks ever close
//! the same socket; readers still holding a reference observe EOF and fail
//! fast.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{LinkError, ProtocolError};
use crate::protocol::{
    encode_into, flags, read_frame, Frame, MessageType, ReasonCode, CONNECT_TIMEOUT, MAX_FRAME_LEN,
    RX_PAYLOAD_CAPACITY, SEND_BUDGET, SOCKET_BUFFER_SIZE,
};
use crate::util::lock;

/// A freshly accepted connection, not yet adopted as the session. The
/// engine applies its accept policy before deciding between [`PeerLink::adopt`]
/// and [`PeerLink::refuse`].
pub struct Accepted {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Accepted {
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// The active peer connection.
#[derive(Debug)]
pub struct PeerSession {
    stream: TcpStream,
    peer_addr: SocketAddr,
    streaming: AtomicBool,
}

impl PeerSession {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            streaming: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_streaming(&self, on: bool) {
        self.streaming.store(on, Ordering::Release);
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

/// Result of a readability poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes are waiting.
    Data,
    /// Nothing to read yet.
    Empty,
    /// Peer performed an orderly shutdown.
    Closed,
}

struct SendState {
    staging: Vec<u8>,
}

/// One-peer TCP endpoint: listener plus at most one active session.
pub struct PeerLink {
    listener: Mutex<Option<TcpListener>>,
    session: Mutex<Option<Arc<PeerSession>>>,
    send: Mutex<SendState>,
    rx_scratch: Mutex<Box<[u8]>>,
}

impl PeerLink {
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
            session: Mutex::new(None),
            send: Mutex::new(SendState {
                staging: Vec::with_capacity(MAX_FRAME_LEN),
            }),
            rx_scratch: Mutex::new(vec![0u8; RX_PAYLOAD_CAPACITY].into_boxed_slice()),
        }
    }

    /// Bind the listening socket (non-blocking, `SO_REUSEADDR`, backlog 1).
    /// Returns the bound port, which differs from `port` when 0 was passed.
    pub fn listen(&self, port: u16) -> Result<u16, LinkError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(LinkError::BindFailed)?;
        socket.set_reuse_address(true).map_err(LinkError::BindFailed)?;
        socket.set_nonblocking(true).map_err(LinkError::BindFailed)?;

        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&addr.into()).map_err(LinkError::BindFailed)?;
        socket.listen(1).map_err(LinkError::BindFailed)?;

        let listener: TcpListener = socket.into();
        let bound = listener.local_addr().map_err(LinkError::BindFailed)?.port();
        *lock(&self.listener) = Some(listener);
        tracing::info!(port = bound, "listening for peer");
        Ok(bound)
    }

    pub fn local_port(&self) -> Option<u16> {
        lock(&self.listener)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn close_listener(&self) {
        lock(&self.listener).take();
    }

    /// Non-blocking accept. `Ok(None)` when nothing is pending.
    pub fn accept(&self) -> io::Result<Option<Accepted>> {
        let guard = lock(&self.listener);
        let Some(listener) = guard.as_ref() else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, addr)) => Ok(Some(Accepted { stream, addr })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reject a pending connection with an `ERROR` frame, then close it.
    pub fn refuse(&self, accepted: Accepted, reason: ReasonCode) {
        tracing::warn!(peer = %accepted.addr, reason = reason.as_str(), "refusing connection");
        let mut frame = Vec::with_capacity(8);
        if encode_into(&mut frame, MessageType::Error, flags::NONE, &[reason as u8]).is_ok() {
            let _ = accepted.stream.set_nonblocking(false);
            let _ = accepted
                .stream
                .set_write_timeout(Some(Duration::from_millis(100)));
            let mut stream = &accepted.stream;
            let _ = stream.write_all(&frame);
        }
        let _ = accepted.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Promote an accepted connection to the active session.
    ///
    /// Fails with [`LinkError::Busy`] if a session already exists; the
    /// caller enforces the one-peer invariant before calling.
    pub fn adopt(&self, accepted: Accepted) -> Result<Arc<PeerSession>, LinkError> {
        configure_peer_socket(&accepted.stream)?;
        let session = Arc::new(PeerSession::new(accepted.stream, accepted.addr));

        let mut guard = lock(&self.session);
        if guard.is_some() {
            return Err(LinkError::Busy);
        }
        *guard = Some(session.clone());
        tracing::info!(peer = %session.peer_addr, "peer connected");
        Ok(session)
    }

    /// Dial a peer. Connection failure or timeout is classified
    /// [`LinkError::Unreachable`].
    pub fn connect(&self, host: &str, port: u16) -> Result<Arc<PeerSession>, LinkError> {
        if lock(&self.session).is_some() {
            return Err(LinkError::Busy);
        }

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| LinkError::Unreachable(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| LinkError::Unreachable(format!("{host}: no address")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket
            .connect_timeout(&addr.into(), CONNECT_TIMEOUT)
            .map_err(|e| LinkError::Unreachable(format!("{addr}: {e}")))?;

        let stream: TcpStream = socket.into();
        configure_peer_socket(&stream)?;
        let session = Arc::new(PeerSession::new(stream, addr));

        let mut guard = lock(&self.session);
        if guard.is_some() {
            return Err(LinkError::Busy);
        }
        *guard = Some(session.clone());
        tracing::info!(peer = %addr, "connected to peer");
        Ok(session)
    }

    pub fn session(&self) -> Option<Arc<PeerSession>> {
        lock(&self.session).clone()
    }

    pub fn has_session(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Send one frame, retrying partial writes within [`SEND_BUDGET`].
    ///
    /// All callers serialize on the staging-buffer mutex, which makes sends
    /// FIFO across tasks. Budget exhaustion returns an error without
    /// closing the socket; hard errors are left for the caller to act on.
    pub fn send(
        &self,
        session: &PeerSession,
        msg_type: MessageType,
        msg_flags: u8,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = lock(&self.send);
        encode_into(&mut state.staging, msg_type, msg_flags, payload)?;

        let mut offset = 0;
        let started = Instant::now();
        let mut stream = session.stream();

        while offset < state.staging.len() {
            match stream.write(&state.staging[offset..]) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= SEND_BUDGET {
                        return Err(LinkError::SendBudget);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Quiet during shutdown: once streaming is cleared the
                    // socket is expected to die under us.
                    if session.is_streaming() {
                        tracing::warn!(offset, total = state.staging.len(), "send failed: {e}");
                    }
                    return Err(LinkError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// Receive one framed message from the session.
    pub fn recv(&self, session: &PeerSession) -> Result<Frame, ProtocolError> {
        let mut scratch = lock(&self.rx_scratch);
        read_frame(session.stream(), &mut scratch)
    }

    /// Poll the session for readability without consuming bytes.
    pub fn readiness(&self, session: &PeerSession) -> io::Result<Readiness> {
        let mut probe = [0u8; 1];
        match session.stream().peek(&mut probe) {
            Ok(0) => Ok(Readiness::Closed),
            Ok(_) => Ok(Readiness::Data),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Readiness::Empty),
            Err(e) => Err(e),
        }
    }

    /// Tear down the active session, if any.
    ///
    /// Clears the streaming flag, sends a best-effort `STOP`, then shuts
    /// the socket down both ways. The swap under the lock guarantees only
    /// one task runs the close sequence.
    pub fn close_session(&self) -> bool {
        let Some(session) = lock(&self.session).take() else {
            return false;
        };
        session.set_streaming(false);
        let _ = self.send(&session, MessageType::Stop, flags::NONE, &[]);
        let _ = session.stream.shutdown(std::net::Shutdown::Both);
        tracing::info!(peer = %session.peer_addr, "peer disconnected");
        true
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer sockets run non-blocking with Nagle off and enlarged OS buffers to
/// absorb audio bursts.
fn configure_peer_socket(stream: &TcpStream) -> Result<(), LinkError> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let sock = SockRef::from(stream);
    sock.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(())
}
