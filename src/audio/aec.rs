//! Acoustic echo cancellation support: the DSP kernel seam and the frame
//! aligner that feeds it.
//!
//! The kernel itself is an external collaborator (a pure function on three
//! same-length frames). This module owns everything around it: accumulating
//! capture chunks into full kernel frames, pulling the delayed speaker
//! reference, and carrying leftover samples across callbacks.

use crate::audio::ring::ByteRing;
use crate::constants::SAMPLES_PER_CHUNK;
use crate::error::AudioError;

/// Kernel frame sizes accepted by the aligner, in samples.
const MIN_FRAME_SAMPLES: usize = SAMPLES_PER_CHUNK;
const MAX_FRAME_SAMPLES: usize = 1024;

/// AEC DSP kernel.
///
/// `process` removes the echo of `reference` from `mic` into `out`; all
/// three slices have exactly `frame_samples()` elements.
pub trait EchoCanceller: Send {
    fn frame_samples(&self) -> usize;
    fn process(&mut self, mic: &[i16], reference: &[i16], out: &mut [i16]);
}

/// Identity kernel: output equals mic input. Useful for exercising the
/// alignment path without a DSP library.
pub struct Passthrough {
    frame_samples: usize,
}

impl Passthrough {
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples }
    }
}

impl EchoCanceller for Passthrough {
    fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn process(&mut self, mic: &[i16], _reference: &[i16], out: &mut [i16]) {
        out.copy_from_slice(mic);
    }
}

/// Accumulates capture chunks into kernel-sized frames and pairs each frame
/// with the same amount of delayed speaker reference.
pub struct AecAligner {
    kernel: Box<dyn EchoCanceller>,
    frame_samples: usize,
    mic: Vec<i16>,
    mic_fill: usize,
    reference: Vec<i16>,
    ref_bytes: Vec<u8>,
    out: Vec<i16>,
    out_bytes: Vec<u8>,
}

impl AecAligner {
    pub fn new(kernel: Box<dyn EchoCanceller>) -> Result<Self, AudioError> {
        let frame_samples = kernel.frame_samples();
        if !(MIN_FRAME_SAMPLES..=MAX_FRAME_SAMPLES).contains(&frame_samples) {
            return Err(AudioError::InvalidFrameSize(frame_samples));
        }
        Ok(Self {
            kernel,
            frame_samples,
            mic: vec![0; frame_samples],
            mic_fill: 0,
            reference: vec![0; frame_samples],
            ref_bytes: vec![0; frame_samples * 2],
            out: vec![0; frame_samples],
            out_bytes: vec![0; frame_samples * 2],
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Processed frame size in bytes, as sent on the wire.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * 2
    }

    /// Drop any partially accumulated frame. Called when streaming pauses
    /// and on every call start.
    pub fn reset(&mut self) {
        self.mic_fill = 0;
    }

    /// Feed one capture chunk of 16-bit LE PCM.
    ///
    /// Returns the processed frame when the accumulator fills, carrying any
    /// tail samples over to the next frame. A short reference read is
    /// zero-padded rather than stalling the mic path.
    pub fn feed(&mut self, chunk: &[u8], reference: &mut ByteRing) -> Option<&[u8]> {
        let samples = chunk.len() / 2;
        let take = samples.min(self.frame_samples - self.mic_fill);

        for (slot, pair) in self.mic[self.mic_fill..self.mic_fill + take]
            .iter_mut()
            .zip(chunk.chunks_exact(2))
        {
            *slot = i16::from_le_bytes([pair[0], pair[1]]);
        }
        self.mic_fill += take;

        if self.mic_fill < self.frame_samples {
            return None;
        }

        let got = reference.read(&mut self.ref_bytes);
        self.ref_bytes[got..].fill(0);
        for (slot, pair) in self.reference.iter_mut().zip(self.ref_bytes.chunks_exact(2)) {
            *slot = i16::from_le_bytes([pair[0], pair[1]]);
        }

        self.kernel.process(&self.mic, &self.reference, &mut self.out);

        for (dst, sample) in self.out_bytes.chunks_exact_mut(2).zip(&self.out) {
            dst.copy_from_slice(&sample.to_le_bytes());
        }

        // Carry samples beyond the frame boundary into the next frame.
        self.mic_fill = 0;
        if take < samples {
            let tail = &chunk[take * 2..samples * 2];
            for (slot, pair) in self.mic.iter_mut().zip(tail.chunks_exact(2)) {
                *slot = i16::from_le_bytes([pair[0], pair[1]]);
            }
            self.mic_fill = samples - take;
        }

        Some(&self.out_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn as_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn rejects_invalid_frame_size() {
        assert!(AecAligner::new(Box::new(Passthrough::new(0))).is_err());
        assert!(AecAligner::new(Box::new(Passthrough::new(4096))).is_err());
        assert!(AecAligner::new(Box::new(Passthrough::new(512))).is_ok());
    }

    #[test]
    fn identity_kernel_output_matches_mic_input() {
        let mut aligner = AecAligner::new(Box::new(Passthrough::new(512))).unwrap();
        let mut reference = ByteRing::new(4096);

        let first: Vec<i16> = (0..256).collect();
        let second: Vec<i16> = (256..512).collect();

        assert!(aligner.feed(&pcm(&first), &mut reference).is_none());
        let out = aligner.feed(&pcm(&second), &mut reference).unwrap().to_vec();

        let mut expected = first;
        expected.extend(second);
        assert_eq!(as_samples(&out), expected);
    }

    #[test]
    fn short_reference_is_zero_padded() {
        struct RefEcho;
        impl EchoCanceller for RefEcho {
            fn frame_samples(&self) -> usize {
                256
            }
            fn process(&mut self, _mic: &[i16], reference: &[i16], out: &mut [i16]) {
                out.copy_from_slice(reference);
            }
        }

        let mut aligner = AecAligner::new(Box::new(RefEcho)).unwrap();
        let mut reference = ByteRing::new(4096);
        reference.write(&pcm(&[9i16; 100]));

        let out = aligner
            .feed(&pcm(&[1i16; 256]), &mut reference)
            .unwrap()
            .to_vec();
        let samples = as_samples(&out);
        assert_eq!(&samples[..100], &[9i16; 100][..]);
        assert_eq!(&samples[100..], &[0i16; 156][..]);
    }

    #[test]
    fn tail_samples_carry_into_next_frame() {
        // Frame of 300 samples fed with 256-sample chunks: the second chunk
        // completes a frame with 212 samples left over.
        let mut aligner = AecAligner::new(Box::new(Passthrough::new(300))).unwrap();
        let mut reference = ByteRing::new(4096);

        let chunk_a: Vec<i16> = (0..256).collect();
        let chunk_b: Vec<i16> = (256..512).collect();

        assert!(aligner.feed(&pcm(&chunk_a), &mut reference).is_none());
        let frame1 = aligner.feed(&pcm(&chunk_b), &mut reference).unwrap().to_vec();
        assert_eq!(as_samples(&frame1), (0..300).collect::<Vec<i16>>());

        // 212 carried + 88 from the next chunk completes frame two.
        let chunk_c: Vec<i16> = (512..768).collect();
        let frame2 = aligner.feed(&pcm(&chunk_c), &mut reference).unwrap().to_vec();
        assert_eq!(as_samples(&frame2), (300..600).collect::<Vec<i16>>());
    }

    #[test]
    fn sample_counts_balance_across_frames() {
        let mut aligner = AecAligner::new(Box::new(Passthrough::new(512))).unwrap();
        let mut reference = ByteRing::new(8192);

        let mut fed = 0usize;
        let mut emitted = 0usize;
        for i in 0..40 {
            let chunk = pcm(&vec![i as i16; 256]);
            fed += 256;
            if let Some(out) = aligner.feed(&chunk, &mut reference) {
                emitted += out.len() / 2;
            }
        }
        // Everything fed is either emitted or held as at most one
        // in-flight frame.
        assert!(fed - emitted < 512);
        assert_eq!((fed - emitted) % 256, 0);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut aligner = AecAligner::new(Box::new(Passthrough::new(512))).unwrap();
        let mut reference = ByteRing::new(4096);

        assert!(aligner.feed(&pcm(&[5i16; 256]), &mut reference).is_none());
        aligner.reset();

        let a: Vec<i16> = vec![1; 256];
        let b: Vec<i16> = vec![2; 256];
        assert!(aligner.feed(&pcm(&a), &mut reference).is_none());
        let out = aligner.feed(&pcm(&b), &mut reference).unwrap().to_vec();
        let samples = as_samples(&out);
        assert_eq!(&samples[..256], &a[..]);
        assert_eq!(&samples[256..], &b[..]);
    }
}
