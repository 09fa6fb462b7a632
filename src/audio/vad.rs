//! Voice-activity producer: turns capture frames into engine events.
//!
//! Every frame is forwarded as [`Event::AudioFrame`] unconditionally; the
//! reducer decides what to do with it. On top of that the producer tracks
//! speech edges: a rising edge fires when the VAD model's probability
//! crosses the threshold *and* the frame's energy clears the floor, and a
//! falling edge fires once the model has been quiet for the hangover
//! window. The producer never touches state.

use crate::audio::{AudioChunk, compute_rms_energy};
use crate::config::VadConfig;
use crate::engine::events::Event;
use crate::providers::VoiceActivityModel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Edge-tracking state for one microphone stream.
pub struct VadProducer {
    model: Box<dyn VoiceActivityModel>,
    config: VadConfig,
    sample_rate: u32,
    in_speech: bool,
    silent_ms: u64,
    frame_ms: u64,
}

/// Per-frame output of [`VadProducer::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    None,
    SpeechStart,
    SpeechEnd,
}

impl VadProducer {
    pub fn new(model: Box<dyn VoiceActivityModel>, config: VadConfig, sample_rate: u32) -> Self {
        Self {
            model,
            config,
            sample_rate,
            in_speech: false,
            silent_ms: 0,
            frame_ms: 0,
        }
    }

    /// Score one frame and update edge state.
    pub fn process(&mut self, samples: &[f32], rms: f32) -> VadEdge {
        self.frame_ms = (samples.len() as u64).saturating_mul(1_000) / u64::from(self.sample_rate);
        let probability = self.model.score(samples);
        let speechy = probability >= self.config.threshold && rms > self.config.energy_floor;

        if speechy {
            self.silent_ms = 0;
            if !self.in_speech {
                self.in_speech = true;
                return VadEdge::SpeechStart;
            }
        } else if self.in_speech {
            self.silent_ms = self.silent_ms.saturating_add(self.frame_ms);
            if self.silent_ms >= self.config.hangover_ms {
                self.in_speech = false;
                self.silent_ms = 0;
                return VadEdge::SpeechEnd;
            }
        }
        VadEdge::None
    }
}

/// Run the VAD stage: consume capture chunks, emit engine events.
pub async fn run_vad_stage(
    mut rx: mpsc::Receiver<AudioChunk>,
    events: mpsc::UnboundedSender<Event>,
    mut producer: VadProducer,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                let rms = compute_rms_energy(&chunk.samples);
                let edge = producer.process(&chunk.samples, rms);
                let now_ms = chunk.captured_ms;

                if events
                    .send(Event::AudioFrame {
                        samples: Arc::new(chunk.samples),
                        rms,
                        now_ms,
                    })
                    .is_err()
                {
                    break;
                }
                match edge {
                    VadEdge::SpeechStart => {
                        debug!("speech rising edge at {now_ms}ms");
                        let _ = events.send(Event::VadSpeechStart { now_ms });
                    }
                    VadEdge::SpeechEnd => {
                        debug!("speech falling edge at {now_ms}ms");
                        let _ = events.send(Event::VadSpeechEnd { now_ms });
                    }
                    VadEdge::None => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    /// Model that scores high whenever the frame has any energy.
    struct EnergyModel;

    impl VoiceActivityModel for EnergyModel {
        fn score(&mut self, frame: &[f32]) -> f32 {
            if compute_rms_energy(frame) > 0.001 {
                0.9
            } else {
                0.1
            }
        }
    }

    fn producer() -> VadProducer {
        VadProducer::new(Box::new(EnergyModel), VadConfig::default(), 16_000)
    }

    #[test]
    fn rising_edge_fires_once() {
        let mut vad = producer();
        let voiced = vec![0.5_f32; 512];
        assert_eq!(vad.process(&voiced, 0.5), VadEdge::SpeechStart);
        assert_eq!(vad.process(&voiced, 0.5), VadEdge::None);
    }

    #[test]
    fn quiet_frames_below_energy_floor_do_not_start_speech() {
        let mut vad = producer();
        // Model says speech but energy is under the floor.
        let faint = vec![0.002_f32; 512];
        assert_eq!(vad.process(&faint, 0.002), VadEdge::None);
    }

    #[test]
    fn falling_edge_waits_for_hangover() {
        let mut vad = producer();
        let voiced = vec![0.5_f32; 512];
        let silent = vec![0.0_f32; 512];
        assert_eq!(vad.process(&voiced, 0.5), VadEdge::SpeechStart);

        // 512 samples at 16kHz = 32ms per frame; hangover is 240ms.
        let mut edges = Vec::new();
        for _ in 0..10 {
            edges.push(vad.process(&silent, 0.0));
        }
        assert_eq!(edges.iter().filter(|e| **e == VadEdge::SpeechEnd).count(), 1);
        // The edge must not fire before the hangover has elapsed.
        assert_eq!(edges[0], VadEdge::None);
        assert_eq!(edges[1], VadEdge::None);
    }

    #[test]
    fn brief_dip_does_not_end_speech() {
        let mut vad = producer();
        let voiced = vec![0.5_f32; 512];
        let silent = vec![0.0_f32; 512];
        assert_eq!(vad.process(&voiced, 0.5), VadEdge::SpeechStart);
        assert_eq!(vad.process(&silent, 0.0), VadEdge::None);
        assert_eq!(vad.process(&voiced, 0.5), VadEdge::None);
        // Hangover counter reset by the voiced frame; silence must last
        // the full window again.
        assert_eq!(vad.process(&silent, 0.0), VadEdge::None);
    }
}
