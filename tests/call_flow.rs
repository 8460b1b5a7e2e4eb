//! End-to-end call scenarios over loopback TCP with stub audio devices.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use lan_intercom::audio::{CaptureHandle, CaptureSource, PlaybackSink};
use lan_intercom::error::AudioError;
use lan_intercom::protocol::{encode_frame, flags, MessageType, ReasonCode, HEADER_LEN};
use lan_intercom::settings::MemoryStore;
use lan_intercom::{CallEndReason, CallEngine, CallEvent, CallState, ConnState, IntercomConfig};

struct NullCapture;

impl CaptureSource for NullCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
    fn stop(&mut self) {}
}

#[derive(Clone, Default)]
struct SinkProbe {
    played: Arc<Mutex<Vec<u8>>>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl SinkProbe {
    fn played(&self) -> Vec<u8> {
        self.played.lock().unwrap().clone()
    }
}

struct RecordingSink {
    probe: SinkProbe,
}

impl PlaybackSink for RecordingSink {
    fn start(&mut self) -> Result<(), AudioError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn play(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.probe.played.lock().unwrap().extend_from_slice(pcm);
        Ok(())
    }
    fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn set_volume(&mut self, _volume: f32) {}
}

struct Endpoint {
    engine: CallEngine,
    events: Receiver<CallEvent>,
    mic: CaptureHandle,
    sink: SinkProbe,
}

fn endpoint(auto_answer: bool, ringing_timeout_ms: u32) -> Endpoint {
    let config = IntercomConfig {
        port: 0,
        device_name: "TestEndpoint".to_string(),
        auto_answer,
        ringing_timeout_ms,
        ..Default::default()
    };

    let probe = SinkProbe::default();
    let mic_slot: Arc<Mutex<Option<CaptureHandle>>> = Arc::new(Mutex::new(None));
    let slot = mic_slot.clone();

    let engine = CallEngine::new(
        config,
        move |handle| {
            *slot.lock().unwrap() = Some(handle);
            Box::new(NullCapture)
        },
        Box::new(RecordingSink {
            probe: probe.clone(),
        }),
        None,
        Box::new(MemoryStore::new()),
    )
    .expect("engine construction");

    let events = engine.events();
    let mic = mic_slot.lock().unwrap().take().expect("capture handle");
    Endpoint {
        engine,
        events,
        mic,
        sink: probe,
    }
}

fn dial(endpoint: &Endpoint) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", endpoint.engine.local_port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn send_frame(stream: &mut TcpStream, ty: MessageType, fl: u8, payload: &[u8]) {
    let encoded = encode_frame(ty, fl, payload).unwrap();
    stream.write_all(&encoded).unwrap();
}

/// Blocking framed read on the test side of the socket.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;
    Ok((header[0], header[1], payload))
}

/// Read frames until one of the wanted type arrives, skipping AUDIO noise.
fn read_frame_of_type(stream: &mut TcpStream, ty: MessageType) -> (u8, Vec<u8>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no {ty:?} frame within deadline");
        let (got, fl, payload) = read_frame(stream).expect("peer closed while waiting");
        if got == ty as u8 {
            return (fl, payload);
        }
    }
}

fn wait_for_event(events: &Receiver<CallEvent>, wanted: impl Fn(&CallEvent) -> bool) -> CallEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("event not observed within deadline");
        let event = events.recv_timeout(remaining).expect("event channel");
        if wanted(&event) {
            return event;
        }
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// The reason event precedes the Idle edge; settle on Idle before
/// asserting terminal state.
fn wait_idle(endpoint: &Endpoint) {
    wait_until("return to idle", || {
        endpoint.engine.call_state() == CallState::Idle
    });
}

fn audio_chunk(seed: u8) -> Vec<u8> {
    (0..512u32).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn auto_answered_incoming_call_streams_both_ways() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Pong);

    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);
    assert_eq!(endpoint.engine.call_state(), CallState::Streaming);

    // Peer to speaker.
    let inbound = audio_chunk(3);
    send_frame(&mut peer, MessageType::Audio, flags::NONE, &inbound);
    wait_until("audio reaching the sink", || {
        endpoint.sink.played().windows(inbound.len()).any(|w| w == inbound)
    });

    // Mic to peer.
    let outbound = audio_chunk(7);
    endpoint.mic.push(&outbound);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no AUDIO frame from endpoint");
        let (ty, _fl, payload) = read_frame(&mut peer).unwrap();
        if ty == MessageType::Audio as u8 && payload == outbound {
            break;
        }
    }
}

#[test]
fn caller_name_is_published() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"Kitchen");
    let event = wait_for_event(&endpoint.events, |e| matches!(e, CallEvent::Caller(_)));
    assert_eq!(event, CallEvent::Caller("Kitchen".to_string()));
}

#[test]
fn manual_answer_then_local_hangup() {
    let endpoint = endpoint(false, 10_000);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Ring);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Ringing);
    assert_eq!(endpoint.engine.call_state(), CallState::Ringing);

    endpoint.engine.answer();
    read_frame_of_type(&mut peer, MessageType::Answer);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);

    endpoint.engine.stop();
    read_frame_of_type(&mut peer, MessageType::Stop);
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::LocalHangup)
    });
    wait_idle(&endpoint);

    // Socket is closed after the STOP.
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn unanswered_ring_times_out() {
    let endpoint = endpoint(false, 400);
    let mut peer = dial(&endpoint);

    let started = Instant::now();
    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Ring);

    read_frame_of_type(&mut peer, MessageType::Stop);
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::Timeout)
    });
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(380), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "too late: {elapsed:?}");
    wait_idle(&endpoint);
}

#[test]
fn declined_call_sends_busy() {
    let endpoint = endpoint(false, 10_000);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Ring);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Ringing);

    endpoint.engine.decline();
    let (_fl, payload) = read_frame_of_type(&mut peer, MessageType::Error);
    assert_eq!(payload, vec![ReasonCode::Busy as u8]);
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::Declined)
    });
    wait_idle(&endpoint);
}

#[test]
fn dialing_unreachable_host_fails_within_budget() {
    let endpoint = endpoint(true, 0);

    // Bind and drop to get a port with nothing behind it.
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let started = Instant::now();
    endpoint.engine.connect_to("127.0.0.1", dead_port);
    let event = wait_for_event(&endpoint.events, |e| matches!(e, CallEvent::CallFailed(_)));
    assert_eq!(event, CallEvent::CallFailed(CallEndReason::Unreachable));
    assert!(started.elapsed() < Duration::from_secs(6));
    wait_idle(&endpoint);
}

#[test]
fn second_caller_is_rejected_busy() {
    let endpoint = endpoint(true, 0);
    let mut first = dial(&endpoint);

    send_frame(&mut first, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut first, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);

    let stats_before = endpoint.engine.stats();

    // A third party barging in gets ERROR{BUSY} and a closed socket.
    let mut intruder = dial(&endpoint);
    let (_fl, payload) = read_frame_of_type(&mut intruder, MessageType::Error);
    assert_eq!(payload, vec![ReasonCode::Busy as u8]);
    let mut rest = Vec::new();
    intruder.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // The established call is unaffected.
    assert_eq!(endpoint.engine.call_state(), CallState::Streaming);
    let inbound = audio_chunk(9);
    send_frame(&mut first, MessageType::Audio, flags::NONE, &inbound);
    wait_until("audio still flowing", || {
        endpoint.engine.stats().spk_bytes_in > stats_before.spk_bytes_in
    });
}

#[test]
fn start_split_into_single_bytes_still_answers() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    let encoded = encode_frame(MessageType::Start, flags::NONE, b"slow-peer").unwrap();
    for byte in encoded {
        peer.write_all(&[byte]).unwrap();
        peer.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    read_frame_of_type(&mut peer, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);
}

#[test]
fn no_ring_start_marks_relayed_caller() {
    let endpoint = endpoint(false, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NO_RING, b"Workshop");
    read_frame_of_type(&mut peer, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::OutgoingCall);
    assert_eq!(endpoint.engine.call_state(), CallState::Outgoing);

    // The far end answering shows up as its first audio.
    send_frame(&mut peer, MessageType::Audio, flags::NONE, &audio_chunk(1));
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);
}

#[test]
fn remote_stop_hangs_up() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);

    send_frame(&mut peer, MessageType::Stop, flags::NONE, &[]);
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::RemoteHangup)
    });
    wait_idle(&endpoint);
}

#[test]
fn peer_disconnect_is_remote_hangup() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);

    drop(peer);
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::RemoteHangup)
    });
    wait_idle(&endpoint);
}

#[test]
fn ping_gets_pong() {
    let endpoint = endpoint(false, 0);
    let mut peer = dial(&endpoint);

    // Connected but not in a call; keepalive must be answered.
    send_frame(&mut peer, MessageType::Ping, flags::NONE, &[]);
    read_frame_of_type(&mut peer, MessageType::Pong);
    assert_eq!(endpoint.engine.call_state(), CallState::Idle);
}

#[test]
fn client_dial_start_pong_handshake() {
    let endpoint = endpoint(true, 0);

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    endpoint.engine.connect_to("127.0.0.1", port);
    let (mut peer, _) = server.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Dialing opens with START carrying our display name.
    let (ty, _fl, payload) = read_frame(&mut peer).unwrap();
    assert_eq!(ty, MessageType::Start as u8);
    assert_eq!(payload, b"TestEndpoint");
    assert_eq!(endpoint.engine.call_state(), CallState::Outgoing);

    // PONG acknowledges the START and opens the audio path.
    send_frame(&mut peer, MessageType::Pong, flags::NONE, &[]);
    wait_until("audio path open", || {
        endpoint.engine.conn_state() == ConnState::Streaming
    });

    let outbound = audio_chunk(5);
    endpoint.mic.push(&outbound);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no AUDIO frame after PONG ack");
        let (ty, _fl, payload) = read_frame(&mut peer).unwrap();
        if ty == MessageType::Audio as u8 {
            assert_eq!(payload, outbound);
            break;
        }
    }

    // The far end answering (first AUDIO) completes the call setup.
    send_frame(&mut peer, MessageType::Audio, flags::NONE, &audio_chunk(2));
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);
}

#[test]
fn busy_error_while_dialing_fails_the_call() {
    let endpoint = endpoint(true, 0);

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    endpoint.engine.connect_to("127.0.0.1", port);
    let (mut peer, _) = server.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    read_frame(&mut peer).unwrap(); // START

    send_frame(
        &mut peer,
        MessageType::Error,
        flags::NONE,
        &[ReasonCode::Busy as u8],
    );
    let event = wait_for_event(&endpoint.events, |e| matches!(e, CallEvent::CallFailed(_)));
    assert_eq!(event, CallEvent::CallFailed(CallEndReason::Busy));
    wait_idle(&endpoint);
}

#[test]
fn engine_to_engine_full_duplex_call() {
    let callee = endpoint(true, 0);
    let caller = endpoint(true, 0);

    caller
        .engine
        .connect_to("127.0.0.1", callee.engine.local_port());

    wait_for_event(&callee.events, |e| *e == CallEvent::Streaming);

    // Callee mic -> caller speaker; the first frame also completes the
    // caller's setup.
    let from_callee = audio_chunk(11);
    wait_until("callee audio reaching caller", || {
        callee.mic.push(&from_callee);
        caller
            .sink
            .played()
            .windows(from_callee.len())
            .any(|w| w == from_callee)
    });
    wait_for_event(&caller.events, |e| *e == CallEvent::Streaming);

    // Caller mic -> callee speaker.
    let from_caller = audio_chunk(13);
    wait_until("caller audio reaching callee", || {
        caller.mic.push(&from_caller);
        callee
            .sink
            .played()
            .windows(from_caller.len())
            .any(|w| w == from_caller)
    });

    // Local hangup mirrors to the peer.
    caller.engine.stop();
    wait_for_event(&caller.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::LocalHangup)
    });
    wait_for_event(&callee.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::RemoteHangup)
    });
    wait_idle(&caller);
    wait_idle(&callee);
}

#[test]
fn sink_stop_goes_through_playback_task() {
    let endpoint = endpoint(true, 0);
    let mut peer = dial(&endpoint);

    send_frame(&mut peer, MessageType::Start, flags::NONE, b"unit-a");
    read_frame_of_type(&mut peer, MessageType::Pong);
    wait_for_event(&endpoint.events, |e| *e == CallEvent::Streaming);
    wait_until("sink started", || {
        endpoint.sink.starts.load(Ordering::SeqCst) > 0
    });

    endpoint.engine.stop();
    wait_for_event(&endpoint.events, |e| {
        *e == CallEvent::Hangup(CallEndReason::LocalHangup)
    });
    assert_eq!(endpoint.sink.stops.load(Ordering::SeqCst), 1);
}
