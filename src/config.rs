//! Configuration types for the conversation engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Everything here is a runtime knob; the persona itself (prompts, timing,
/// authority) lives in [`crate::profile::Profile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Interruption (barge-in) detection settings.
    pub interrupt: InterruptConfig,
    /// Retry policy for transient collaborator failures.
    pub retry: RetryConfig,
    /// Tick cadence in milliseconds. `0` disables the internal tick
    /// producer so a host can drive time itself (harness, tests).
    pub tick_interval_ms: u64,
    /// Maximum number of messages retained in conversation memory.
    pub memory_max_messages: usize,
    /// Seed for acknowledgment selection. `None` seeds from entropy;
    /// a fixed seed makes the full reduction trace reproducible.
    pub ack_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            interrupt: InterruptConfig::default(),
            retry: RetryConfig::default(),
            tick_interval_ms: 25,
            memory_max_messages: 64,
            ack_seed: None,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Capture frame size in samples (512 at 16 kHz ≈ 32 ms).
    pub frame_size: usize,
    /// Playback chunk length in milliseconds. The synthesizer checks the
    /// interrupt flag between chunks, so this bounds barge-in latency.
    pub playback_chunk_ms: u64,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 512,
            playback_chunk_ms: 100,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Model probability threshold for the speech rising edge.
    pub threshold: f32,
    /// RMS energy floor. A frame counts as voiced only above this, which
    /// keeps faint room noise from opening a turn.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub energy_floor: f32,
    /// Hangover window in milliseconds before the falling edge fires.
    pub hangover_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            energy_floor: 0.01,
            hangover_ms: 240,
        }
    }
}

/// Interruption (barge-in) detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Debounce window after an accepted interruption, in milliseconds.
    pub debounce_ms: u64,
    /// Consecutive voiced frames required for an energy spike.
    pub energy_spike_frames: u8,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            energy_spike_frames: 2,
        }
    }
}

/// Retry policy for transient collaborator failures (ASR, LLM, TTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per operation (first try included).
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds; doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1).as_millis(), 200);
        assert_eq!(retry.delay_for(2).as_millis(), 400);
        assert_eq!(retry.delay_for(3).as_millis(), 800);
        assert_eq!(retry.delay_for(10).as_millis(), 2_000);
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tick_interval_ms, 25);
        assert_eq!(back.audio.frame_size, 512);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interrupt.debounce_ms, 250);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.memory_max_messages, 64);
    }
}
