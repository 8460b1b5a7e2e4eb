//! Network task: session establishment, framed receive, FSM dispatch of
//! inbound messages, keepalive and call timeouts.
//!
//! Runs hot (1 ms poll) while streaming, relaxes to a 10 ms read poll with
//! a peer connected, and sleeps up to 100 ms on the wake channel when idle.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use super::state::{CallEndReason, CallEvent, CallState, ConnState};
use super::EngineShared;
use crate::error::{LinkError, ProtocolError};
use crate::net::link::Readiness;
use crate::protocol::{flags, Frame, MessageType, ReasonCode, PING_INTERVAL};

pub(crate) fn net_loop(shared: Arc<EngineShared>, wake: Receiver<()>) {
    tracing::debug!("net task started");
    let mut last_ping = Instant::now();

    while !shared.is_shutdown() {
        let session_now = shared.link.session();
        let streaming = session_now.as_ref().map(|s| s.is_streaming()).unwrap_or(false);

        // Busy-poll while streaming, 10 ms pacing while a peer is connected
        // (keeps ringing/outgoing timeouts tight), up to 100 ms when idle.
        if streaming {
            let _ = wake.try_recv();
        } else if session_now.is_some() {
            let _ = wake.recv_timeout(Duration::from_millis(10));
        } else {
            let _ = wake.recv_timeout(Duration::from_millis(100));
        }
        drop(session_now);
        if shared.is_shutdown() {
            break;
        }

        shared.flush_settings();
        check_call_timeouts(&shared);

        if shared.take_link_failure() && shared.link.has_session() {
            shared.handle_disconnect();
            continue;
        }

        if !shared.link.has_session() && shared.is_client_mode() {
            maybe_dial(&shared, &mut last_ping);
        }
        poll_accept(&shared, &mut last_ping);

        let Some(session) = shared.link.session() else {
            continue;
        };

        match shared.link.readiness(&session) {
            Ok(Readiness::Data) => match shared.link.recv(&session) {
                Ok(frame) => handle_frame(&shared, &frame, &mut last_ping),
                Err(ProtocolError::Closed) => {
                    tracing::info!("peer closed the connection");
                    shared.handle_disconnect();
                }
                Err(ProtocolError::Oversize(len)) => {
                    tracing::warn!(len, "oversize frame from peer");
                    let _ = shared.link.send(
                        &session,
                        MessageType::Error,
                        flags::NONE,
                        &[ReasonCode::InvalidMsg as u8],
                    );
                    shared.teardown_call(CallEndReason::ProtocolError);
                }
                Err(ProtocolError::Incomplete) => {
                    tracing::warn!("frame stalled mid-read, dropping peer");
                    shared.handle_disconnect();
                }
                Err(e) => {
                    tracing::warn!("receive failed: {e}");
                    shared.handle_disconnect();
                }
            },
            Ok(Readiness::Closed) => {
                tracing::info!("peer closed the connection");
                shared.handle_disconnect();
            }
            Ok(Readiness::Empty) => {
                thread::sleep(Duration::from_millis(if streaming { 1 } else { 10 }));
            }
            Err(e) => {
                tracing::warn!("socket poll failed: {e}");
                shared.handle_disconnect();
            }
        }

        // Keepalive, suppressed during streaming so PINGs never contend
        // with audio on the send path.
        if let Some(session) = shared.link.session() {
            if shared.conn_state() != ConnState::Streaming
                && last_ping.elapsed() >= PING_INTERVAL
            {
                let _ = shared
                    .link
                    .send(&session, MessageType::Ping, flags::NONE, &[]);
                last_ping = Instant::now();
            }
        }
    }
    tracing::debug!("net task stopped");
}

/// Ringing and outgoing calls share one auto-hangup timeout. Both sides
/// see a `STOP` so the peers stay in sync.
fn check_call_timeouts(shared: &EngineShared) {
    let timeout_ms = shared.ringing_timeout_ms();
    if timeout_ms == 0 {
        return;
    }
    let timeout = Duration::from_millis(u64::from(timeout_ms));
    let (call, ringing_start, outgoing_start) = shared.timeout_deadlines();

    match call {
        CallState::Ringing => {
            if ringing_start.is_some_and(|t| t.elapsed() >= timeout) {
                tracing::info!(timeout_ms, "ringing timeout, hanging up");
                shared.teardown_call(CallEndReason::Timeout);
            }
        }
        CallState::Outgoing => {
            if outgoing_start.is_some_and(|t| t.elapsed() >= timeout) {
                tracing::info!(timeout_ms, "outgoing call timeout, hanging up");
                shared.teardown_call(CallEndReason::Timeout);
            }
        }
        _ => {}
    }
}

/// Client-mode dialing: connect, then open with `START` carrying our name.
fn maybe_dial(shared: &EngineShared, last_ping: &mut Instant) {
    if !shared.is_audio_active() || shared.call_state() != CallState::Outgoing {
        return;
    }
    let Some((host, port)) = shared.remote() else {
        return;
    };

    shared.set_conn(ConnState::Connecting);
    match shared.link.connect(&host, port) {
        Ok(session) => {
            // The call may have been torn down while connect blocked.
            if shared.call_state() != CallState::Outgoing {
                shared.link.close_session();
                return;
            }
            shared.set_conn(ConnState::Connected);
            *last_ping = Instant::now();
            let name = shared.device_name().to_string();
            if let Err(e) =
                shared
                    .link
                    .send(&session, MessageType::Start, flags::NONE, name.as_bytes())
            {
                tracing::warn!("START send failed: {e}");
                shared.teardown_call(CallEndReason::Unreachable);
            }
        }
        Err(LinkError::Busy) => {}
        Err(e) => {
            tracing::warn!("dial {host}:{port} failed: {e}");
            shared.teardown_call(CallEndReason::Unreachable);
        }
    }
}

/// Accept policy: one session at most, and only while `Idle` (normal) or
/// `Outgoing` (the bridge calling us back in a relayed call). Everything
/// else is refused with `ERROR{BUSY}`.
fn poll_accept(shared: &EngineShared, last_ping: &mut Instant) {
    let accepted = match shared.link.accept() {
        Ok(Some(accepted)) => accepted,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("accept failed: {e}");
            return;
        }
    };

    if shared.link.has_session() {
        shared.link.refuse(accepted, ReasonCode::Busy);
        return;
    }
    let call = shared.call_state();
    if call != CallState::Idle && call != CallState::Outgoing {
        shared.link.refuse(accepted, ReasonCode::Busy);
        return;
    }

    match shared.link.adopt(accepted) {
        Ok(_session) => {
            shared.set_conn(ConnState::Connected);
            *last_ping = Instant::now();
        }
        Err(e) => tracing::warn!("adopt failed: {e}"),
    }
}

/// The inbound-message reaction table. Every edge of the call FSM driven
/// by the peer lives here.
fn handle_frame(shared: &EngineShared, frame: &Frame, last_ping: &mut Instant) {
    let Some(msg_type) = frame.message_type() else {
        // Unknown types are logged and ignored for forward compatibility.
        tracing::warn!(ty = frame.header.msg_type, "unknown message type");
        return;
    };
    let Some(session) = shared.link.session() else {
        return;
    };

    match msg_type {
        MessageType::Audio => {
            shared.pipeline.enqueue_playback(&frame.payload);
            let (call, conn) = shared.snapshot();
            if conn != ConnState::Streaming {
                shared.set_conn(ConnState::Streaming);
            }
            // For the caller, the first audio means the far end answered.
            if call == CallState::Outgoing {
                tracing::info!("destination answered, audio flowing");
                shared.set_call_state(CallState::Streaming);
            }
        }

        MessageType::Start => handle_start(shared, frame),

        MessageType::Stop => {
            tracing::info!("received STOP from peer");
            shared.teardown_call(CallEndReason::RemoteHangup);
        }

        MessageType::Ping => {
            let _ = shared
                .link
                .send(&session, MessageType::Pong, flags::NONE, &[]);
        }

        MessageType::Pong => {
            *last_ping = Instant::now();
            // Client side: PONG doubles as the ACK for our START.
            if shared.is_client_mode() && shared.conn_state() == ConnState::Connected {
                tracing::info!("START acknowledged, enabling audio");
                shared.enable_audio_flow();
            }
        }

        MessageType::Answer => match shared.call_state() {
            CallState::Outgoing => {
                tracing::info!("call answered");
                shared.begin_streaming();
                let _ = shared
                    .link
                    .send(&session, MessageType::Pong, flags::NONE, &[]);
            }
            CallState::Ringing => {
                tracing::info!("call answered remotely");
                shared.set_call_state(CallState::Answering);
                shared.begin_streaming();
                let _ = shared
                    .link
                    .send(&session, MessageType::Pong, flags::NONE, &[]);
            }
            state => tracing::warn!(%state, "ANSWER in unexpected state"),
        },

        MessageType::Error => {
            let reason = frame.payload.first().copied();
            let known = reason.and_then(ReasonCode::from_u8);
            tracing::warn!(
                reason = known.map(|r| r.as_str()).unwrap_or("unknown"),
                raw = reason,
                "received ERROR"
            );
            // A dialed peer answering BUSY fails the call; other reasons
            // only matter if a disconnect follows.
            if known == Some(ReasonCode::Busy) && shared.call_state() == CallState::Outgoing {
                shared.teardown_call(CallEndReason::Busy);
            }
        }

        MessageType::Ring => {
            tracing::debug!("peer is ringing");
        }
    }
}

fn handle_start(shared: &EngineShared, frame: &Frame) {
    let no_ring = frame.header.flags & flags::NO_RING != 0;
    let caller = caller_name(&frame.payload);
    let call = shared.call_state();
    let Some(session) = shared.link.session() else {
        return;
    };

    if no_ring {
        // NO_RING marks us as the caller of a relayed call: the bridge
        // dialed us back. Enable audio and wait for the far end's answer
        // (its first AUDIO frame).
        if call != CallState::Idle && call != CallState::Outgoing {
            tracing::warn!(%call, "START(NO_RING) in unexpected state");
            return;
        }
        tracing::info!(
            "calling {}...",
            if caller.is_empty() { "peer" } else { &caller }
        );
        shared.emit(CallEvent::Caller(caller));
        shared.mark_outgoing_start();
        shared.set_call_state(CallState::Outgoing);
        shared.enable_audio_flow();
        let _ = shared
            .link
            .send(&session, MessageType::Pong, flags::NONE, &[]);
        return;
    }

    if call != CallState::Idle {
        tracing::warn!(%call, "START in unexpected state");
        return;
    }

    tracing::info!(
        "incoming call from {}",
        if caller.is_empty() { "peer" } else { &caller }
    );
    shared.emit(CallEvent::Caller(caller));

    if shared.auto_answer() {
        shared.set_call_state(CallState::Answering);
        shared.begin_streaming();
        let _ = shared
            .link
            .send(&session, MessageType::Pong, flags::NONE, &[]);
    } else {
        shared.set_call_state(CallState::Incoming);
        shared.set_conn(ConnState::Connected);
        let _ = shared
            .link
            .send(&session, MessageType::Ring, flags::NONE, &[]);
        tracing::info!("auto-answer off, ringing");
        shared.mark_ringing_start();
        shared.set_call_state(CallState::Ringing);
    }
}

/// Caller display name from a START payload: bytes up to the first NUL,
/// decoded lossily.
fn caller_name(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).trim().to_string()
}
