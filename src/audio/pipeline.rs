//! Capture/playback pipeline between the audio drivers and the peer link.
//!
//! Holds the three byte rings (capture, playback, speaker reference), the
//! capture preprocessor (DC removal, mic gain, saturation) and the playback
//! scheduler with its AEC reference tap. Each ring is guarded by its own
//! mutex with single-copy critical sections; overflow is counted and
//! sample-logged, never fatal.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::audio::aec::AecAligner;
use crate::audio::ring::ByteRing;
use crate::audio::PlaybackSink;
use crate::constants::{
    ref_delay_bytes, AUDIO_CHUNK_SIZE, REF_DELAY_MAX_MS, REF_DELAY_MIN_MS, RX_RING_SIZE,
    TX_RING_SIZE,
};
use crate::util::lock;

/// Largest number of samples preprocessed per pass over the capture buffer.
const PREPROC_BATCH: usize = 512;

/// Chunks drained per playback iteration.
const PLAYBACK_BURST_CHUNKS: usize = 4;

/// Below this volume the output is silenced by not submitting to the sink.
const MUTE_THRESHOLD: f32 = 0.001;

struct MicState {
    ring: ByteRing,
    dc_offset: i32,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub mic_bytes_in: u64,
    pub spk_bytes_in: u64,
    pub mic_overflow: u64,
    pub spk_overflow: u64,
}

/// Shared audio state between the capture callback, the TX task and the
/// playback task.
pub struct AudioPipeline {
    mic: Mutex<MicState>,
    spk_ring: Mutex<ByteRing>,
    spk_ref: Mutex<ByteRing>,
    aligner: Mutex<Option<AecAligner>>,

    /// Capture is accepted only while a call is streaming.
    flowing: AtomicBool,
    aec_enabled: AtomicBool,
    dc_removal: AtomicBool,
    /// Linear mic gain as f32 bits.
    mic_gain_bits: AtomicU32,
    /// Output volume as f32 bits, mirrored from the sink for the reference
    /// tap and the mute gate.
    volume_bits: AtomicU32,
    ref_delay_ms: AtomicU32,

    mic_bytes_in: AtomicU64,
    spk_bytes_in: AtomicU64,
    mic_overflow: AtomicU64,
    spk_overflow: AtomicU64,
    // Drop events, for sampled logging (the byte counters above grow by
    // variable amounts and cannot drive an every-Nth predicate).
    mic_drop_events: AtomicU64,
    spk_drop_events: AtomicU64,
}

impl AudioPipeline {
    pub fn new(aligner: Option<AecAligner>, dc_removal: bool, ref_delay_ms: u32) -> Arc<Self> {
        let ref_delay_ms = clamp_ref_delay(ref_delay_ms);
        // The reference ring must hold the full configured delay plus the
        // working playback window.
        let ref_capacity = ref_delay_bytes(REF_DELAY_MAX_MS) + RX_RING_SIZE;

        Arc::new(Self {
            mic: Mutex::new(MicState {
                ring: ByteRing::new(TX_RING_SIZE),
                dc_offset: 0,
            }),
            spk_ring: Mutex::new(ByteRing::new(RX_RING_SIZE)),
            spk_ref: Mutex::new(ByteRing::new(ref_capacity)),
            aligner: Mutex::new(aligner),
            flowing: AtomicBool::new(false),
            aec_enabled: AtomicBool::new(false),
            dc_removal: AtomicBool::new(dc_removal),
            mic_gain_bits: AtomicU32::new(1.0f32.to_bits()),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            ref_delay_ms: AtomicU32::new(ref_delay_ms),
            mic_bytes_in: AtomicU64::new(0),
            spk_bytes_in: AtomicU64::new(0),
            mic_overflow: AtomicU64::new(0),
            spk_overflow: AtomicU64::new(0),
            mic_drop_events: AtomicU64::new(0),
            spk_drop_events: AtomicU64::new(0),
        })
    }

    pub fn set_flowing(&self, on: bool) {
        self.flowing.store(on, Ordering::Release);
    }

    pub fn is_flowing(&self) -> bool {
        self.flowing.load(Ordering::Acquire)
    }

    pub fn set_mic_gain(&self, linear: f32) {
        self.mic_gain_bits.store(linear.to_bits(), Ordering::Relaxed);
    }

    pub fn mic_gain(&self) -> f32 {
        f32::from_bits(self.mic_gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_dc_removal(&self, enabled: bool) {
        self.dc_removal.store(enabled, Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        self.volume_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_ref_delay_ms(&self, ms: u32) {
        self.ref_delay_ms.store(clamp_ref_delay(ms), Ordering::Relaxed);
    }

    pub fn ref_delay_ms(&self) -> u32 {
        self.ref_delay_ms.load(Ordering::Relaxed)
    }

    pub fn aec_available(&self) -> bool {
        lock(&self.aligner).is_some()
    }

    pub fn aec_enabled(&self) -> bool {
        self.aec_enabled.load(Ordering::Acquire)
    }

    /// Enable or disable echo cancellation. Returns the effective state;
    /// enabling is refused when no kernel was configured.
    pub fn set_aec_enabled(&self, enabled: bool) -> bool {
        if enabled {
            let mut aligner = lock(&self.aligner);
            let Some(aligner) = aligner.as_mut() else {
                tracing::warn!("cannot enable AEC: no kernel configured");
                self.aec_enabled.store(false, Ordering::Release);
                return false;
            };
            aligner.reset();
            self.seed_reference_delay();
        } else if let Some(aligner) = lock(&self.aligner).as_mut() {
            aligner.reset();
        }
        self.aec_enabled.store(enabled, Ordering::Release);
        enabled
    }

    /// Capture entry point, called from the driver callback with 16-bit LE
    /// mono PCM. No back-pressure: bytes that do not fit are dropped.
    pub fn on_capture(&self, data: &[u8]) {
        if !self.is_flowing() {
            return;
        }

        let usable = data.len() & !1;
        if usable == 0 {
            return;
        }
        self.mic_bytes_in.fetch_add(usable as u64, Ordering::Relaxed);

        let gain = self.mic_gain();
        let dc_removal = self.dc_removal.load(Ordering::Relaxed);
        let needs_processing = gain != 1.0 || dc_removal;

        let mut mic = lock(&self.mic);
        let mut written = 0;

        if !needs_processing {
            written += mic.ring.write(&data[..usable]);
        } else {
            let mut scratch = [0u8; PREPROC_BATCH * 2];
            for block in data[..usable].chunks(PREPROC_BATCH * 2) {
                let mut out_len = 0;
                for pair in block.chunks_exact(2) {
                    let mut sample = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                    if dc_removal {
                        // Leaky DC estimator in 24.8 fixed point.
                        mic.dc_offset = ((mic.dc_offset * 255) >> 8) + sample;
                        sample -= mic.dc_offset >> 8;
                    }
                    let scaled = (sample as f32 * gain) as i32;
                    let clamped = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    scratch[out_len..out_len + 2].copy_from_slice(&clamped.to_le_bytes());
                    out_len += 2;
                }
                written += mic.ring.write(&scratch[..out_len]);
            }
        }
        drop(mic);

        if written < usable {
            let dropped = (usable - written) as u64;
            let total = self.mic_overflow.fetch_add(dropped, Ordering::Relaxed) + dropped;
            let events = self.mic_drop_events.fetch_add(1, Ordering::Relaxed) + 1;
            if events <= 5 || events % 100 == 0 {
                tracing::warn!(dropped, total, "mic ring overflow");
            }
        }
    }

    /// Enqueue a received AUDIO payload for playback.
    pub fn enqueue_playback(&self, data: &[u8]) {
        self.spk_bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        let written = lock(&self.spk_ring).write(data);
        if written < data.len() {
            let dropped = (data.len() - written) as u64;
            let total = self.spk_overflow.fetch_add(dropped, Ordering::Relaxed) + dropped;
            let events = self.spk_drop_events.fetch_add(1, Ordering::Relaxed) + 1;
            if events <= 5 || events % 100 == 0 {
                tracing::warn!(dropped, total, "speaker ring overflow");
            }
        }
    }

    /// Pull one canonical chunk off the capture ring for transmission.
    pub fn read_capture_chunk(&self, out: &mut [u8; AUDIO_CHUNK_SIZE]) -> bool {
        let mut mic = lock(&self.mic);
        if mic.ring.available() < AUDIO_CHUNK_SIZE {
            return false;
        }
        mic.ring.read(out) == AUDIO_CHUNK_SIZE
    }

    /// Run a capture chunk through the AEC aligner.
    ///
    /// Returns `None` when AEC is off (the chunk goes out raw), otherwise
    /// whether a full processed frame was copied into `out`.
    pub fn align_tx(&self, chunk: &[u8], out: &mut Vec<u8>) -> Option<bool> {
        if !self.aec_enabled() {
            return None;
        }
        let mut aligner = lock(&self.aligner);
        let aligner = aligner.as_mut()?;
        let mut reference = lock(&self.spk_ref);
        match aligner.feed(chunk, &mut reference) {
            Some(frame) => {
                out.clear();
                out.extend_from_slice(frame);
                Some(true)
            }
            None => Some(false),
        }
    }

    /// Drop any partially accumulated AEC frame.
    pub fn reset_aligner(&self) {
        if let Some(aligner) = lock(&self.aligner).as_mut() {
            aligner.reset();
        }
    }

    /// Drain up to four chunk-aligned chunks into the sink. Returns the
    /// number of bytes taken off the playback ring.
    ///
    /// Every byte submitted to the sink is mirrored, volume-scaled, into the
    /// reference ring so the AEC sees exactly what the room hears.
    pub fn pump_playback(&self, sink: &mut dyn PlaybackSink) -> usize {
        let mut chunk = [0u8; AUDIO_CHUNK_SIZE * PLAYBACK_BURST_CHUNKS];

        let read = {
            let mut spk = lock(&self.spk_ring);
            let avail = spk.available();
            if avail < AUDIO_CHUNK_SIZE {
                return 0;
            }
            let to_read = avail
                .min(chunk.len())
                .div_euclid(AUDIO_CHUNK_SIZE)
                * AUDIO_CHUNK_SIZE;
            spk.read(&mut chunk[..to_read])
        };

        let volume = self.volume();
        if read == 0 || volume <= MUTE_THRESHOLD {
            return read;
        }

        if let Err(e) = sink.play(&chunk[..read]) {
            tracing::warn!("sink play failed: {e}");
            return read;
        }

        if self.aec_enabled() {
            self.tap_reference(&chunk[..read], volume);
        }
        read
    }

    fn tap_reference(&self, played: &[u8], volume: f32) {
        let mut reference = lock(&self.spk_ref);
        if volume == 1.0 {
            reference.write(played);
            return;
        }
        let mut scaled = [0u8; AUDIO_CHUNK_SIZE * PLAYBACK_BURST_CHUNKS];
        for (dst, pair) in scaled.chunks_exact_mut(2).zip(played.chunks_exact(2)) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            let value = ((sample as f32 * volume) as i32)
                .clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            dst.copy_from_slice(&value.to_le_bytes());
        }
        reference.write(&scaled[..played.len()]);
    }

    /// Reset every buffer for a fresh call. Residual audio from a previous
    /// call must never leak into a new one.
    pub fn reset_for_call(&self) {
        {
            let mut mic = lock(&self.mic);
            mic.ring.reset();
            mic.dc_offset = 0;
        }
        lock(&self.spk_ring).reset();
        self.reset_aligner();
        if self.aec_enabled() {
            self.seed_reference_delay();
        }
    }

    /// Reset the reference ring and pre-fill it with `ref_delay_ms` of
    /// silence so the oldest reference sample read sits exactly the
    /// configured delay behind the sample just written.
    fn seed_reference_delay(&self) {
        let delay_bytes = ref_delay_bytes(self.ref_delay_ms());
        let zeros = [0u8; AUDIO_CHUNK_SIZE];
        let mut reference = lock(&self.spk_ref);
        reference.reset();
        let mut remaining = delay_bytes;
        while remaining > 0 {
            let n = reference.write(&zeros[..remaining.min(zeros.len())]);
            if n == 0 {
                break;
            }
            remaining -= n;
        }
        tracing::debug!(ms = self.ref_delay_ms(), bytes = delay_bytes, "seeded AEC reference delay");
    }

    /// Bytes currently buffered in the reference ring.
    pub fn reference_available(&self) -> usize {
        lock(&self.spk_ref).available()
    }

    /// Bytes currently buffered for playback.
    pub fn playback_available(&self) -> usize {
        lock(&self.spk_ring).available()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            mic_bytes_in: self.mic_bytes_in.load(Ordering::Relaxed),
            spk_bytes_in: self.spk_bytes_in.load(Ordering::Relaxed),
            mic_overflow: self.mic_overflow.load(Ordering::Relaxed),
            spk_overflow: self.spk_overflow.load(Ordering::Relaxed),
        }
    }
}

fn clamp_ref_delay(ms: u32) -> u32 {
    ms.clamp(REF_DELAY_MIN_MS, REF_DELAY_MAX_MS)
}

/// Cloneable handle handed to capture drivers; forwards PCM into the
/// pipeline.
#[derive(Clone)]
pub struct CaptureHandle {
    pipeline: Arc<AudioPipeline>,
}

impl CaptureHandle {
    pub fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn push(&self, pcm: &[u8]) {
        self.pipeline.on_capture(pcm);
    }
}
