//! Audio plumbing: microphone capture, the VAD producer, and the
//! synthesizer driver.

pub mod capture;
pub mod playback;
pub mod vad;

/// A chunk of raw audio samples from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at the configured input sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic engine time when the chunk was captured.
    pub captured_ms: u64,
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(compute_rms_energy(&[0.0; 64]), 0.0);
        assert_eq!(compute_rms_energy(&[]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal_is_its_magnitude() {
        let rms = compute_rms_energy(&[0.5; 128]);
        assert!((rms - 0.5).abs() < 1e-6);
    }
}
