//! Transmit and playback task loops.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::EngineShared;
use crate::constants::AUDIO_CHUNK_SIZE;
use crate::error::LinkError;
use crate::protocol::{flags, MessageType, MAX_PAYLOAD};

/// Drains the capture ring, runs the AEC aligner and sends `AUDIO` frames.
/// Yields every iteration; backs off 20 ms while not streaming.
pub(crate) fn tx_loop(shared: Arc<EngineShared>) {
    tracing::debug!("tx task started");

    let mut chunk = [0u8; AUDIO_CHUNK_SIZE];
    let mut aec_frame: Vec<u8> = Vec::with_capacity(MAX_PAYLOAD);

    while !shared.is_shutdown() {
        let session = match shared.link.session() {
            Some(s) if shared.is_audio_active() && s.is_streaming() => s,
            _ => {
                // Pausing invalidates any half-accumulated AEC frame.
                shared.pipeline.reset_aligner();
                thread::sleep(Duration::from_millis(20));
                continue;
            }
        };

        if !shared.pipeline.read_capture_chunk(&mut chunk) {
            thread::sleep(Duration::from_millis(2));
            continue;
        }

        let payload: &[u8] = match shared.pipeline.align_tx(&chunk, &mut aec_frame) {
            // AEC off: raw chunks go out as-is.
            None => &chunk,
            Some(true) => &aec_frame,
            // Frame still accumulating.
            Some(false) => {
                thread::yield_now();
                continue;
            }
        };

        match shared
            .link
            .send(&session, MessageType::Audio, flags::NONE, payload)
        {
            Ok(()) => {}
            Err(LinkError::SendBudget) => {
                // Congested but alive; the chunk is lost, the call is not.
                if session.is_streaming() {
                    tracing::debug!("audio send budget exhausted");
                }
            }
            Err(LinkError::Closed) | Err(LinkError::Io(_)) => {
                shared.flag_link_failure();
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                tracing::debug!("audio send failed: {e}");
            }
        }

        thread::yield_now();
    }
    tracing::debug!("tx task stopped");
}

/// Drains the playback ring into the sink and owns every sink stop.
///
/// Single-owner protocol: the control path requests a stop via the shared
/// flag and waits; only this task calls `sink.stop()`, then acknowledges.
/// That leaves exactly one call site for stop and no play/stop races.
pub(crate) fn playback_loop(shared: Arc<EngineShared>) {
    tracing::debug!("playback task started");

    while !shared.is_shutdown() {
        if shared.sink_stop_requested() {
            tracing::debug!("playback task stopping sink");
            shared.sink().stop();
            shared.mark_sink_stopped();
            while shared.sink_stop_requested() && !shared.is_shutdown() {
                thread::sleep(Duration::from_millis(10));
            }
            continue;
        }

        if !shared.is_audio_active() {
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        shared.ensure_sink_started();

        let pumped = {
            let mut sink = shared.sink();
            shared.pipeline.pump_playback(&mut **sink)
        };
        if pumped == 0 {
            thread::sleep(Duration::from_millis(1));
        } else {
            thread::yield_now();
        }
    }
    tracing::debug!("playback task stopped");
}
