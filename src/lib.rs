//! # LAN Intercom
//!
//! Full-duplex, low-latency voice intercom endpoint for LAN deployments.
//!
//! Each endpoint captures microphone audio, plays received audio on a
//! speaker, and exchanges a length-framed binary protocol with exactly one
//! peer over TCP. An endpoint either listens for one inbound peer or dials a
//! configured peer; a call then progresses through a finite state machine
//! supporting ringing, manual or automatic answer, streaming, decline and
//! hangup, with timeouts mirrored to both sides.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             ENDPOINT                                 │
//! │                                                                      │
//! │  mic driver ──► preprocessor ──► mic_ring ──┐                        │
//! │  (capture cb)   (DC removal,                │                        │
//! │                  gain, clamp)               ▼                        │
//! │                                      ┌────────────┐                  │
//! │                                      │  TX task   │── AUDIO ──► peer │
//! │                                      │ AEC aligner│                  │
//! │                                      └─────▲──────┘                  │
//! │                                            │ reference (delayed)     │
//! │  speaker ◄── playback task ◄── spk_ring ◄──┼──────────── AUDIO ◄─────┤
//! │  driver            │                       │                         │
//! │                    └──► spk_ref_ring ──────┘                         │
//! │                                                                      │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │ net task: accept/connect, framed receive, call FSM dispatch,   │  │
//! │  │ keepalive PING, ringing/outgoing timeouts                      │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`engine::CallEngine`] owns the three tasks and is the host-facing
//! control surface (`start`, `stop`, `answer`, `decline`, `toggle`, volume,
//! mic gain, contacts). Platform audio drivers plug in through the
//! [`audio::CaptureSource`] and [`audio::PlaybackSink`] traits; an AEC DSP
//! kernel plugs in through [`audio::EchoCanceller`].

pub mod audio;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod error;
pub mod net;
pub mod protocol;
pub mod settings;

pub(crate) mod util;

pub use config::IntercomConfig;
pub use engine::{CallEndReason, CallEngine, CallEvent, CallState, ConnState};
pub use error::{Error, Result};

/// Audio format and buffer sizing constants.
///
/// All ring sizes are byte sizes. The wire-protocol constants live in
/// [`crate::protocol`].
pub mod constants {
    /// Sample rate for all audio paths.
    pub const SAMPLE_RATE: u32 = 16_000;

    /// 16-bit signed little-endian PCM.
    pub const BITS_PER_SAMPLE: u8 = 16;

    /// Mono.
    pub const CHANNELS: u8 = 1;

    /// Canonical audio chunk in bytes.
    pub const AUDIO_CHUNK_SIZE: usize = 512;

    /// Samples per canonical chunk.
    pub const SAMPLES_PER_CHUNK: usize = AUDIO_CHUNK_SIZE / 2;

    /// Duration of one chunk at [`SAMPLE_RATE`].
    pub const CHUNK_DURATION_MS: u32 = 16;

    /// Capture ring size (~64 ms of audio).
    pub const TX_RING_SIZE: usize = 2048;

    /// Playback ring size (~256 ms; absorbs several bursty peer chunks).
    pub const RX_RING_SIZE: usize = 8192;

    /// Default AEC reference delay. Compensates DMA plus acoustic round
    /// trip so reference samples line up with their echo in the mic signal.
    pub const REF_DELAY_DEFAULT_MS: u32 = 80;

    /// Lower bound for the configurable reference delay (integrated codecs).
    pub const REF_DELAY_MIN_MS: u32 = 20;

    /// Upper bound for the configurable reference delay.
    pub const REF_DELAY_MAX_MS: u32 = 100;

    /// Bytes of reference audio covering `ms` milliseconds.
    pub const fn ref_delay_bytes(ms: u32) -> usize {
        (SAMPLE_RATE as usize * ms as usize / 1000) * 2
    }
}
