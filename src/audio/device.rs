//! cpal-backed capture and playback drivers.
//!
//! `cpal::Stream` is not `Send`, so each driver runs a dedicated thread
//! that owns the stream and idles while the run flag is set; `start` and
//! `stop` only flip the flag and join. The intercom format is fixed:
//! 16 kHz, 16-bit, mono.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::pipeline::CaptureHandle;
use crate::audio::ring::ByteRing;
use crate::audio::{CaptureSource, PlaybackSink};
use crate::constants::{RX_RING_SIZE, SAMPLE_RATE};
use crate::error::AudioError;
use crate::util::lock;

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default input".to_string())),
    }
}

fn output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default output".to_string())),
    }
}

/// List input/output device names for the demo binary.
pub fn device_names() -> (Vec<String>, Vec<String>) {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default();
    let outputs = host
        .output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default();
    (inputs, outputs)
}

/// Microphone capture through cpal, feeding the pipeline via its
/// [`CaptureHandle`].
pub struct CpalCapture {
    device_name: Option<String>,
    handle: CaptureHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>, handle: CaptureHandle) -> Self {
        Self {
            device_name,
            handle,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CaptureSource for CpalCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let device = input_device(self.device_name.as_deref())?;
        let running = self.running.clone();
        let handle = self.handle.clone();
        running.store(true, Ordering::SeqCst);

        let run_flag = running.clone();
        let thread = thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || {
                let config = stream_config();
                let data_handle = handle;
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mut bytes = Vec::with_capacity(data.len() * 2);
                        for sample in data {
                            bytes.extend_from_slice(&sample.to_le_bytes());
                        }
                        data_handle.push(&bytes);
                    },
                    |err| tracing::warn!("capture stream error: {err}"),
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start capture stream: {e}");
                            return;
                        }
                        while run_flag.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // Stream drops here, stopping capture.
                    }
                    Err(e) => tracing::error!("failed to build capture stream: {e}"),
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker playback through cpal. `play` enqueues into an internal ring
/// drained by the output callback, which also applies the volume.
pub struct CpalSink {
    device_name: Option<String>,
    ring: Arc<Mutex<ByteRing>>,
    volume_bits: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            ring: Arc::new(Mutex::new(ByteRing::new(RX_RING_SIZE))),
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl PlaybackSink for CpalSink {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let device = output_device(self.device_name.as_deref())?;
        let ring = self.ring.clone();
        let volume_bits = self.volume_bits.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let run_flag = running.clone();
        let thread = thread::Builder::new()
            .name("cpal-playback".to_string())
            .spawn(move || {
                let config = stream_config();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let volume = f32::from_bits(volume_bits.load(Ordering::Relaxed));
                        let mut bytes = vec![0u8; data.len() * 2];
                        let read = lock(&ring).read(&mut bytes);
                        for (i, sample) in data.iter_mut().enumerate() {
                            let value = if i * 2 + 1 < read {
                                i16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]])
                            } else {
                                0 // underrun plays silence
                            };
                            *sample = ((f32::from(value) * volume) as i32)
                                .clamp(i32::from(i16::MIN), i32::from(i16::MAX))
                                as i16;
                        }
                    },
                    |err| tracing::warn!("playback stream error: {err}"),
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start playback stream: {e}");
                            return;
                        }
                        while run_flag.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => tracing::error!("failed to build playback stream: {e}"),
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn play(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        lock(&self.ring).write(pcm);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        lock(&self.ring).reset();
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}
