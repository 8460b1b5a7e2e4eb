//! The call engine: owns the peer link, the audio pipeline and the three
//! real-time tasks, and exposes the host-facing control surface.
//!
//! Shutdown ordering is a hard contract enforced by [`EngineShared::teardown_call`]:
//! clear the streaming flag, close the peer socket, stop the sink through
//! the single-owner protocol, stop capture, then transition the FSM to
//! `Idle` with a reason event. Only the playback task calls sink stop (with
//! a forced fallback if it does not acknowledge in time).

pub mod state;

mod net;
mod stream;

pub use state::{CallEndReason, CallEvent, CallState, ConnState};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audio::aec::{AecAligner, EchoCanceller};
use crate::audio::pipeline::{AudioPipeline, CaptureHandle, PipelineStats};
use crate::audio::{CaptureSource, PlaybackSink};
use crate::config::{db_to_linear, IntercomConfig};
use crate::contacts::Contacts;
use crate::error::{EngineError, Result};
use crate::net::PeerLink;
use crate::protocol::{flags, MessageType, ReasonCode};
use crate::settings::{SettingsSaver, SettingsStore, StoredSettings, FLAG_AEC, FLAG_AUTO_ANSWER};
use crate::util::lock;

/// How long the engine waits for the playback task to acknowledge a sink
/// stop before forcing it.
const SINK_STOP_TIMEOUT: Duration = Duration::from_millis(200);

/// Event channel depth; events beyond this are dropped and counted.
const EVENT_QUEUE_DEPTH: usize = 256;

struct FsmState {
    call: CallState,
    conn: ConnState,
    ringing_start: Option<Instant>,
    outgoing_start: Option<Instant>,
}

pub(crate) struct EngineShared {
    device_name: String,

    pub(crate) link: PeerLink,
    pub(crate) pipeline: Arc<AudioPipeline>,
    capture: Mutex<Box<dyn CaptureSource>>,
    sink: Mutex<Box<dyn PlaybackSink>>,

    fsm: Mutex<FsmState>,
    contacts: Mutex<Contacts>,
    saver: Mutex<SettingsSaver>,

    auto_answer: AtomicBool,
    ringing_timeout_ms: AtomicU32,
    mic_gain_db_bits: AtomicU32,
    client_mode: AtomicBool,
    remote: Mutex<Option<(String, u16)>>,

    /// Audio hardware running (capture started, sink start requested).
    active: AtomicBool,
    shutdown: AtomicBool,

    sink_started: AtomicBool,
    sink_stop_requested: AtomicBool,
    sink_stopped_tx: Sender<()>,
    sink_stopped_rx: Mutex<Receiver<()>>,

    /// Set by the TX task on a hard send error; reaped by the net task.
    link_failed: AtomicBool,

    wake_tx: Sender<()>,
    events_tx: Sender<CallEvent>,
    event_drops: AtomicU64,

    /// Serializes concurrent teardowns (local stop racing a remote close).
    teardown_lock: Mutex<()>,
}

impl EngineShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn is_audio_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_client_mode(&self) -> bool {
        self.client_mode.load(Ordering::Acquire)
    }

    pub(crate) fn remote(&self) -> Option<(String, u16)> {
        lock(&self.remote).clone()
    }

    pub(crate) fn auto_answer(&self) -> bool {
        self.auto_answer.load(Ordering::Acquire)
    }

    pub(crate) fn ringing_timeout_ms(&self) -> u32 {
        self.ringing_timeout_ms.load(Ordering::Acquire)
    }

    pub(crate) fn device_name(&self) -> &str {
        &self.device_name
    }

    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        if self.events_tx.try_send(event).is_err() {
            let drops = self.event_drops.fetch_add(1, Ordering::Relaxed) + 1;
            if drops <= 5 || drops % 100 == 0 {
                tracing::warn!(total = drops, "event queue full, dropping");
            }
        }
    }

    pub(crate) fn call_state(&self) -> CallState {
        lock(&self.fsm).call
    }

    pub(crate) fn conn_state(&self) -> ConnState {
        lock(&self.fsm).conn
    }

    pub(crate) fn snapshot(&self) -> (CallState, ConnState) {
        let fsm = lock(&self.fsm);
        (fsm.call, fsm.conn)
    }

    pub(crate) fn set_conn(&self, conn: ConnState) {
        lock(&self.fsm).conn = conn;
    }

    pub(crate) fn mark_outgoing_start(&self) {
        lock(&self.fsm).outgoing_start = Some(Instant::now());
    }

    pub(crate) fn mark_ringing_start(&self) {
        lock(&self.fsm).ringing_start = Some(Instant::now());
    }

    pub(crate) fn timeout_deadlines(&self) -> (CallState, Option<Instant>, Option<Instant>) {
        let fsm = lock(&self.fsm);
        (fsm.call, fsm.ringing_start, fsm.outgoing_start)
    }

    /// Every FSM edge funnels through here: state update plus the matching
    /// event and the publishable state string.
    pub(crate) fn set_call_state(&self, new_state: CallState) {
        let old_state = {
            let mut fsm = lock(&self.fsm);
            if fsm.call == new_state {
                return;
            }
            let old = fsm.call;
            fsm.call = new_state;
            if new_state == CallState::Idle {
                fsm.ringing_start = None;
                fsm.outgoing_start = None;
            }
            old
        };

        tracing::info!("call state: {old_state} -> {new_state}");

        self.emit(match new_state {
            CallState::Idle => CallEvent::Idle,
            CallState::Outgoing => CallEvent::OutgoingCall,
            CallState::Incoming => CallEvent::IncomingCall,
            CallState::Ringing => CallEvent::Ringing,
            CallState::Answering => CallEvent::Answered,
            CallState::Streaming => CallEvent::Streaming,
        });
        self.emit(CallEvent::State(new_state));
    }

    /// Close out the current call with a reason. No-op when already idle,
    /// which keeps the "exactly one Idle transition per call" invariant.
    fn end_call(&self, reason: CallEndReason) {
        if self.call_state() == CallState::Idle {
            return;
        }
        tracing::info!("call ended: {reason}");
        self.emit(if reason.is_failure() {
            CallEvent::CallFailed(reason)
        } else {
            CallEvent::Hangup(reason)
        });
        self.set_call_state(CallState::Idle);
    }

    /// Start or stop the audio hardware.
    ///
    /// Stopping routes the sink through the single-owner protocol: the
    /// playback task observes the request flag, stops the sink and signals
    /// back. A wedged playback task is given [`SINK_STOP_TIMEOUT`] before
    /// the stop is forced from here.
    fn set_audio_active(&self, on: bool) {
        let was = self.active.swap(on, Ordering::AcqRel);
        if was == on {
            return;
        }

        if on {
            self.sink_stop_requested.store(false, Ordering::Release);
            if let Err(e) = lock(&self.capture).start() {
                tracing::warn!("capture start failed: {e}");
            }
        } else {
            if self.sink_started.load(Ordering::Acquire) {
                let rx = lock(&self.sink_stopped_rx);
                while rx.try_recv().is_ok() {}
                self.sink_stop_requested.store(true, Ordering::Release);
                if rx.recv_timeout(SINK_STOP_TIMEOUT).is_err() {
                    tracing::warn!("sink stop timeout, forcing stop");
                    lock(&self.sink).stop();
                    self.sink_started.store(false, Ordering::Release);
                }
                self.sink_stop_requested.store(false, Ordering::Release);
            }
            lock(&self.capture).stop();
        }
    }

    /// Open the audio path for a (re)starting stream: hardware on, every
    /// buffer reset, reference delay re-seeded, capture gate open. Does not
    /// touch the call FSM; the transport is promoted to `Streaming`.
    pub(crate) fn enable_audio_flow(&self) {
        self.set_audio_active(true);
        self.pipeline.reset_for_call();
        self.pipeline.set_flowing(true);
        if let Some(session) = self.link.session() {
            session.set_streaming(true);
        }
        self.set_conn(ConnState::Streaming);
    }

    /// Full entry into `Streaming`.
    pub(crate) fn begin_streaming(&self) {
        self.enable_audio_flow();
        self.set_call_state(CallState::Streaming);
    }

    /// The shutdown-ordering contract. Streaming flags first, socket
    /// second, sink third, capture fourth, FSM last.
    pub(crate) fn teardown_call(&self, reason: CallEndReason) {
        let _guard = lock(&self.teardown_lock);

        let had_call = self.call_state() != CallState::Idle;

        self.pipeline.set_flowing(false);
        if let Some(session) = self.link.session() {
            session.set_streaming(false);
        }
        let had_session = self.link.close_session();
        self.set_audio_active(false);
        self.set_conn(ConnState::Disconnected);

        if had_call || had_session {
            self.emit(CallEvent::Caller(String::new()));
        }
        self.end_call(reason);
    }

    /// Peer vanished: recv saw EOF or a send hit a hard error.
    pub(crate) fn handle_disconnect(&self) {
        self.teardown_call(CallEndReason::RemoteHangup);
    }

    pub(crate) fn flag_link_failure(&self) {
        self.link_failed.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn take_link_failure(&self) -> bool {
        self.link_failed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn flush_settings(&self) {
        lock(&self.saver).flush_due(Instant::now());
    }

    fn schedule_save(&self, mutate: impl FnOnce(&mut StoredSettings)) {
        lock(&self.saver).update(mutate);
    }

    // Sink plumbing for the playback task.

    pub(crate) fn sink(&self) -> MutexGuard<'_, Box<dyn PlaybackSink>> {
        lock(&self.sink)
    }

    pub(crate) fn sink_stop_requested(&self) -> bool {
        self.sink_stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_sink_stopped(&self) {
        self.sink_started.store(false, Ordering::Release);
        let _ = self.sink_stopped_tx.try_send(());
    }

    pub(crate) fn ensure_sink_started(&self) {
        if self.sink_started.load(Ordering::Acquire) {
            return;
        }
        let result = lock(&self.sink).start();
        match result {
            Ok(()) => self.sink_started.store(true, Ordering::Release),
            Err(e) => {
                tracing::warn!("sink start failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// The intercom endpoint: construction wires the pipeline, link and tasks
/// together; dropping it tears the call down and joins the tasks.
pub struct CallEngine {
    shared: Arc<EngineShared>,
    events_rx: Receiver<CallEvent>,
    tasks: Vec<JoinHandle<()>>,
    local_port: u16,
}

impl CallEngine {
    /// Build and start an endpoint.
    ///
    /// `capture_factory` receives the handle that routes driver PCM into
    /// the pipeline and returns the capture driver; `canceller` is the
    /// optional AEC kernel. The listener is bound immediately (`port` 0
    /// picks an ephemeral port, see [`CallEngine::local_port`]).
    pub fn new(
        config: IntercomConfig,
        capture_factory: impl FnOnce(CaptureHandle) -> Box<dyn CaptureSource>,
        mut sink: Box<dyn PlaybackSink>,
        canceller: Option<Box<dyn EchoCanceller>>,
        store: Box<dyn SettingsStore>,
    ) -> Result<Self> {
        let config = config.sanitized();

        let aligner = canceller.map(AecAligner::new).transpose()?;
        let pipeline = AudioPipeline::new(aligner, config.dc_offset_removal, config.ref_delay_ms);
        let capture = capture_factory(CaptureHandle::new(pipeline.clone()));

        // Persisted settings override the matching config fields.
        let mut saver = SettingsSaver::new(store, config.settings_key.clone());
        let mut defaults = StoredSettings::default();
        defaults.volume_pct = (config.volume * 100.0).round() as u8;
        defaults.mic_gain_db = config.mic_gain_db.round() as i8;
        defaults.set_flag(FLAG_AUTO_ANSWER, config.auto_answer);
        saver.seed(defaults);
        let settings = saver.load();

        let volume = f32::from(settings.volume_pct) / 100.0;
        let mic_gain_db = f32::from(settings.mic_gain_db);
        pipeline.set_volume(volume);
        sink.set_volume(volume);
        pipeline.set_mic_gain(db_to_linear(mic_gain_db));
        if settings.aec() {
            pipeline.set_aec_enabled(true);
        }

        let mut contacts = Contacts::new(config.device_name.clone());
        if !config.contacts.is_empty() {
            contacts.set_csv(&config.contacts.join(","));
        }

        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        let (wake_tx, wake_rx) = bounded(4);
        let (sink_stopped_tx, sink_stopped_rx) = bounded(1);

        let shared = Arc::new(EngineShared {
            device_name: config.device_name.clone(),
            link: PeerLink::new(),
            pipeline,
            capture: Mutex::new(capture),
            sink: Mutex::new(sink),
            fsm: Mutex::new(FsmState {
                call: CallState::Idle,
                conn: ConnState::Disconnected,
                ringing_start: None,
                outgoing_start: None,
            }),
            contacts: Mutex::new(contacts),
            saver: Mutex::new(saver),
            auto_answer: AtomicBool::new(settings.auto_answer()),
            ringing_timeout_ms: AtomicU32::new(config.ringing_timeout_ms),
            mic_gain_db_bits: AtomicU32::new(mic_gain_db.to_bits()),
            client_mode: AtomicBool::new(false),
            remote: Mutex::new(None),
            active: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            sink_started: AtomicBool::new(false),
            sink_stop_requested: AtomicBool::new(false),
            sink_stopped_tx,
            sink_stopped_rx: Mutex::new(sink_stopped_rx),
            link_failed: AtomicBool::new(false),
            wake_tx,
            events_tx,
            event_drops: AtomicU64::new(0),
            teardown_lock: Mutex::new(()),
        });

        let local_port = shared.link.listen(config.port)?;

        let mut tasks = Vec::with_capacity(3);
        let net_shared = shared.clone();
        tasks.push(spawn_task("intercom-net", move || {
            net::net_loop(net_shared, wake_rx)
        })?);
        let tx_shared = shared.clone();
        tasks.push(spawn_task("intercom-tx", move || stream::tx_loop(tx_shared))?);
        let playback_shared = shared.clone();
        tasks.push(spawn_task("intercom-playback", move || {
            stream::playback_loop(playback_shared)
        })?);

        tracing::info!(port = local_port, name = %config.device_name, "intercom endpoint ready");

        Ok(Self {
            shared,
            events_rx,
            tasks,
            local_port,
        })
    }

    /// Port the endpoint listens on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Event stream; every FSM edge produces events here.
    pub fn events(&self) -> Receiver<CallEvent> {
        self.events_rx.clone()
    }

    // === Call control ===

    /// Place a call to the selected destination. In client mode this also
    /// dials the configured peer; in server mode the bridge calls back.
    pub fn start(&self) {
        if self.shared.call_state() != CallState::Idle {
            tracing::warn!(state = %self.shared.call_state(), "already in a call");
            return;
        }
        let destination = self.current_destination();
        tracing::info!("calling {destination}...");

        self.shared.set_audio_active(true);
        self.shared.mark_outgoing_start();
        self.shared.set_call_state(CallState::Outgoing);
        self.shared.wake();
    }

    /// Hang up the current call.
    pub fn stop(&self) {
        if !self.shared.is_audio_active() && self.shared.call_state() == CallState::Idle {
            return;
        }
        tracing::info!("hanging up");
        self.shared.teardown_call(CallEndReason::LocalHangup);
    }

    /// Answer a ringing incoming call.
    pub fn answer(&self) {
        if !self.is_ringing() {
            tracing::warn!("answer() while not ringing");
            return;
        }
        let Some(session) = self.shared.link.session() else {
            tracing::warn!("answer() without a peer");
            return;
        };
        tracing::info!("answering call");
        let _ = self
            .shared
            .link
            .send(&session, MessageType::Answer, flags::NONE, &[]);
        self.shared.set_call_state(CallState::Answering);
        self.shared.begin_streaming();
    }

    /// Decline a ringing incoming call with `ERROR{BUSY}`.
    pub fn decline(&self) {
        if !self.is_ringing() {
            tracing::warn!("decline() while not ringing");
            return;
        }
        if let Some(session) = self.shared.link.session() {
            tracing::info!("declining call");
            let _ = self.shared.link.send(
                &session,
                MessageType::Error,
                flags::NONE,
                &[ReasonCode::Busy as u8],
            );
        }
        self.shared.teardown_call(CallEndReason::Declined);
    }

    /// Ringing answers, an active call hangs up, idle starts a new call.
    pub fn toggle(&self) {
        if self.is_ringing() {
            self.answer();
        } else if self.is_active() {
            self.stop();
        } else {
            self.start();
        }
    }

    /// Dial a specific peer instead of waiting for one.
    pub fn connect_to(&self, host: impl Into<String>, port: u16) {
        *lock(&self.shared.remote) = Some((host.into(), port));
        self.shared.client_mode.store(true, Ordering::Release);
        self.start();
    }

    /// Hang up and leave client mode.
    pub fn disconnect(&self) {
        self.stop();
        self.shared.client_mode.store(false, Ordering::Release);
    }

    /// Report a host-orchestration failure for the current call.
    pub fn fail_call(&self, reason: CallEndReason) {
        self.shared.teardown_call(reason);
    }

    // === Tuning ===

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.shared.pipeline.set_volume(volume);
        self.shared.sink().set_volume(volume);
        self.shared
            .schedule_save(|s| s.volume_pct = (volume * 100.0).round() as u8);
    }

    pub fn volume(&self) -> f32 {
        self.shared.pipeline.volume()
    }

    /// Mic gain on a dB scale, -20..=+20.
    pub fn set_mic_gain_db(&self, db: f32) {
        let db = db.clamp(-20.0, 20.0);
        self.shared
            .mic_gain_db_bits
            .store(db.to_bits(), Ordering::Relaxed);
        self.shared.pipeline.set_mic_gain(db_to_linear(db));
        tracing::debug!("mic gain set to {db:.1} dB");
        self.shared
            .schedule_save(move |s| s.mic_gain_db = db.round() as i8);
    }

    pub fn mic_gain_db(&self) -> f32 {
        f32::from_bits(self.shared.mic_gain_db_bits.load(Ordering::Relaxed))
    }

    pub fn set_auto_answer(&self, enabled: bool) {
        self.shared.auto_answer.store(enabled, Ordering::Release);
        tracing::info!("auto-answer {}", if enabled { "on" } else { "off" });
        self.shared
            .schedule_save(move |s| s.set_flag(FLAG_AUTO_ANSWER, enabled));
    }

    pub fn auto_answer(&self) -> bool {
        self.shared.auto_answer()
    }

    /// Enable or disable echo cancellation; returns the effective state
    /// (enabling is refused without a configured kernel).
    pub fn set_aec_enabled(&self, enabled: bool) -> bool {
        let effective = self.shared.pipeline.set_aec_enabled(enabled);
        self.shared
            .schedule_save(move |s| s.set_flag(FLAG_AEC, effective));
        effective
    }

    pub fn aec_enabled(&self) -> bool {
        self.shared.pipeline.aec_enabled()
    }

    /// Auto-hangup for unanswered calls; 0 disables.
    pub fn set_ringing_timeout_ms(&self, timeout_ms: u32) {
        self.shared
            .ringing_timeout_ms
            .store(timeout_ms, Ordering::Release);
    }

    pub fn set_dc_offset_removal(&self, enabled: bool) {
        self.shared.pipeline.set_dc_removal(enabled);
    }

    pub fn set_ref_delay_ms(&self, ms: u32) {
        self.shared.pipeline.set_ref_delay_ms(ms);
    }

    // === Contacts ===

    pub fn set_contacts(&self, csv: &str) {
        let current = {
            let mut contacts = lock(&self.shared.contacts);
            contacts.set_csv(csv);
            contacts.current().to_string()
        };
        self.shared.emit(CallEvent::Destination(current));
    }

    pub fn next_contact(&self) {
        let current = {
            let mut contacts = lock(&self.shared.contacts);
            contacts.next();
            contacts.current().to_string()
        };
        tracing::info!("selected contact: {current}");
        self.shared.emit(CallEvent::Destination(current));
    }

    pub fn prev_contact(&self) {
        let current = {
            let mut contacts = lock(&self.shared.contacts);
            contacts.prev();
            contacts.current().to_string()
        };
        tracing::info!("selected contact: {current}");
        self.shared.emit(CallEvent::Destination(current));
    }

    pub fn current_destination(&self) -> String {
        lock(&self.shared.contacts).current().to_string()
    }

    pub fn contacts_csv(&self) -> String {
        lock(&self.shared.contacts).csv()
    }

    // === State queries ===

    pub fn call_state(&self) -> CallState {
        self.shared.call_state()
    }

    pub fn conn_state(&self) -> ConnState {
        self.shared.conn_state()
    }

    pub fn is_idle(&self) -> bool {
        self.call_state() == CallState::Idle
    }

    pub fn is_streaming(&self) -> bool {
        self.call_state() == CallState::Streaming
    }

    pub fn is_ringing(&self) -> bool {
        self.call_state() == CallState::Ringing && self.shared.link.has_session()
    }

    /// A call is in progress (dialing, answering or streaming).
    pub fn is_active(&self) -> bool {
        matches!(
            self.call_state(),
            CallState::Streaming | CallState::Answering | CallState::Outgoing
        )
    }

    pub fn state_str(&self) -> &'static str {
        self.call_state().as_str()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.pipeline.stats()
    }

    /// Stop everything and join the tasks. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        // Tear the call down while the tasks still run, so the sink stop
        // goes through the playback task; only then stop the tasks.
        self.shared.teardown_call(CallEndReason::LocalHangup);
        self.shared.link.close_listener();
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
        lock(&self.shared.saver).flush_now();
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_task(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| EngineError::Spawn(e.to_string()).into())
}
