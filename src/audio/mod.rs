//! Audio subsystem: ring buffers, capture/playback pipeline, AEC alignment
//! and platform device adapters.

pub mod aec;
pub mod device;
pub mod pipeline;
pub mod ring;

pub use aec::{AecAligner, EchoCanceller, Passthrough};
pub use pipeline::{AudioPipeline, CaptureHandle, PipelineStats};
pub use ring::ByteRing;

use crate::error::AudioError;

/// Platform capture driver seam.
///
/// Implementations deliver 16-bit LE mono PCM through the data callback they
/// were constructed with (see [`pipeline::CaptureHandle`]); the pipeline
/// applies preprocessing and enqueueing. There is no back-pressure toward
/// the driver: bytes that do not fit are dropped and counted.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self);
}

/// Platform playback driver seam.
///
/// `start`, `play` and `stop` are called only by the engine's playback
/// task; `set_volume` may be called from the control path. `stop` must be
/// idempotent (the engine retains a forced-stop fallback for a wedged
/// playback task).
pub trait PlaybackSink: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn play(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
    fn stop(&mut self);
    /// Output volume in `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);
}
