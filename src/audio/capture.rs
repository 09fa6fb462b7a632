//! Microphone audio capture using cpal.
//!
//! Opens the device at its native configuration, mixes down to mono, and
//! resamples to the pipeline rate in software. Losing the input device is
//! fatal to the conversation: the capture stage reports the failure and
//! the engine shuts down.

use crate::audio::AudioChunk;
use crate::config::AudioConfig;
use crate::engine::EngineClock;
use crate::error::{EngineError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Audio capture from the system microphone via cpal.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    pipeline_rate: u32,
    frame_len: usize,
}

/// Resolve the configured input device, or the system default when the
/// requested one is missing or none was named.
fn pick_input_device(requested: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(wanted) = requested {
        let found = host
            .input_devices()
            .map_err(|e| EngineError::Audio(format!("device enumeration failed: {e}")))?
            .find(|d| d.description().is_ok_and(|desc| desc.name() == wanted));
        match found {
            Some(device) => return Ok(device),
            None => warn!("input device '{wanted}' is unavailable, using system default"),
        }
    }
    host.default_input_device()
        .ok_or_else(|| EngineError::Audio("no usable input device".into()))
}

impl CpalCapture {
    /// Create a new capture instance.
    ///
    /// The device runs at its own preferred configuration; conversion to
    /// the pipeline's mono rate happens in the capture callback.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let device = pick_input_device(config.input_device.as_deref())?;
        info!(
            "capture device: {}",
            device
                .description()
                .map(|d| d.name().to_owned())
                .unwrap_or_else(|_| "<unknown>".into())
        );

        let device_config = device
            .default_input_config()
            .map_err(|e| EngineError::Audio(format!("no default input config: {e}")))?;
        let device_rate = device_config.sample_rate();
        let device_channels = device_config.channels();
        if device_rate != config.input_sample_rate {
            info!(
                "resampling capture {device_rate}Hz -> {}Hz",
                config.input_sample_rate
            );
        }

        Ok(Self {
            device,
            stream_config: StreamConfig {
                channels: device_channels,
                sample_rate: device_rate,
                buffer_size: cpal::BufferSize::Default,
            },
            pipeline_rate: config.input_sample_rate,
            frame_len: config.frame_size,
        })
    }

    /// Run the capture loop, sending fixed-size chunks until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started;
    /// the caller treats this as fatal.
    pub async fn run(
        &self,
        tx: mpsc::Sender<AudioChunk>,
        clock: EngineClock,
        cancel: CancellationToken,
    ) -> Result<()> {
        let device_rate = self.stream_config.sample_rate;
        let device_channels = self.stream_config.channels as usize;
        let pipeline_rate = self.pipeline_rate;
        let frame_len = self.frame_len.max(1);

        let mut backlog: VecDeque<f32> = VecDeque::with_capacity(frame_len * 4);
        let tx_closed = AtomicBool::new(false);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = mix_down(data, device_channels);
                    backlog.extend(resample(&mono, device_rate, pipeline_rate));

                    while backlog.len() >= frame_len {
                        if tx_closed.load(Ordering::Relaxed) {
                            backlog.clear();
                            break;
                        }
                        let frame: Vec<f32> = backlog.drain(..frame_len).collect();
                        // try_send keeps the audio callback non-blocking.
                        match tx.try_send(AudioChunk {
                            samples: frame,
                            sample_rate: pipeline_rate,
                            captured_ms: clock.now_ms(),
                        }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("audio channel full, dropping chunk");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tx_closed.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| EngineError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::Audio(format!("failed to start input stream: {e}")))?;

        info!("audio capture started: {device_rate}Hz device, {pipeline_rate}Hz pipeline");
        cancel.cancelled().await;
        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }
}

/// Mix interleaved multi-channel audio down to mono with a running
/// per-frame accumulator.
fn mix_down(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    let mut acc = 0.0f32;
    for (i, sample) in interleaved.iter().enumerate() {
        acc += sample;
        if (i + 1) % channels == 0 {
            mono.push(acc / channels as f32);
            acc = 0.0;
        }
    }
    mono
}

/// Resample by averaging the source samples that land in each output
/// frame (a box filter). Speech energy sits far below the folded band
/// edge at these rates, so no separate anti-alias stage is needed.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let step = f64::from(src_rate) / f64::from(dst_rate);
    let mut out = Vec::with_capacity((samples.len() as f64 / step).ceil() as usize);
    let mut cursor = 0.0f64;
    while (cursor as usize) < samples.len() {
        let begin = cursor as usize;
        let end = ((cursor + step) as usize).clamp(begin + 1, samples.len());
        let sum: f32 = samples[begin..end].iter().sum();
        out.push(sum / (end - begin) as f32);
        cursor += step;
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn mix_down_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5];
        assert_eq!(mix_down(&stereo, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn mix_down_passes_mono_through() {
        let mono = [0.1, 0.2, 0.3];
        assert_eq!(mix_down(&mono, 1), mono.to_vec());
    }

    #[test]
    fn resample_scales_length_by_rate_ratio() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        assert_eq!(resample(&samples, 48_000, 16_000).len(), 160);
        assert_eq!(resample(&samples, 32_000, 16_000).len(), 240);
    }

    #[test]
    fn resample_preserves_a_constant_signal() {
        let samples = vec![0.25_f32; 300];
        let out = resample(&samples, 48_000, 16_000);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }
}
