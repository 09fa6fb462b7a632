//! Synthesizer driver: sentences in, speaker audio out.
//!
//! Consumes the sentence queue fed by the turn processor, fetches audio
//! from the TTS collaborator, and plays it in short chunks. The shared
//! interrupt flag is checked before every chunk write, so barge-in stops
//! playback within one chunk. On interruption the driver stops the
//! device, drains the queue, and reports `TtsCancelled`; on a normal
//! drain it reports `TtsFinished`.

use crate::config::RetryConfig;
use crate::engine::events::Event;
use crate::error::{EngineError, Result};
use crate::providers::{SynthesizedSpeech, TextToSpeech, TtsError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One unit of work for the synthesizer.
#[derive(Debug, Clone)]
pub enum SentenceJob {
    /// Speak a sentence in the given voice. Interjections
    /// (acknowledgments, concessions) play outside the turn flow and
    /// produce no turn events.
    Speak {
        text: String,
        voice: String,
        interjection: bool,
    },
    /// The turn's sentence stream is complete; report `TtsFinished` once
    /// playback drains.
    EndOfUtterance,
}

/// Playback seam: the driver writes chunks through this so the harness
/// and tests can run without a real output device.
pub trait AudioSink: Send {
    /// Play one chunk, blocking until it has been written out.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the chunk.
    fn write(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;

    /// Discard any device-side audio immediately.
    fn stop(&mut self);
}

/// Sink that swallows audio; used by the harness and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32], _sample_rate: u32) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Speaker output via cpal.
pub struct CpalSink {
    device: cpal::Device,
    stream_config: StreamConfig,
}

impl CpalSink {
    /// Open the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(output_device: Option<&str>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = output_device {
            host.output_devices()
                .map_err(|e| EngineError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| EngineError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| EngineError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self {
            device,
            stream_config: StreamConfig {
                channels: 1,
                sample_rate,
                buffer_size: cpal::BufferSize::Default,
            },
        })
    }
}

/// Progress tracker shared with the output callback.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: samples.to_vec(),
            position: 0,
            finished: false,
        }));
        let buffer_clone = Arc::clone(&buffer);

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_clone.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| EngineError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::Audio(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let finished = buffer
                .lock()
                .map(|b| b.finished)
                .map_err(|e| EngineError::Audio(format!("playback buffer lock poisoned: {e}")))?;
            if finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }

    fn stop(&mut self) {
        // Streams live only inside write(), so there is nothing queued
        // device-side between chunks.
    }
}

/// Everything the synthesizer stage needs.
pub(crate) struct SynthesizerStage {
    pub tts: Arc<dyn TextToSpeech>,
    pub chunk_ms: u64,
    pub retry: RetryConfig,
    pub events: mpsc::UnboundedSender<Event>,
    pub interrupt: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

/// Spawn the synthesizer on a blocking thread with its own small runtime,
/// since chunk writes block for their playback duration.
pub(crate) fn spawn_synthesizer(
    stage: SynthesizerStage,
    rx: mpsc::Receiver<SentenceJob>,
    sink: Box<dyn AudioSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("failed to create synthesizer runtime: {e}");
                return;
            }
        };
        runtime.block_on(run_synthesizer(stage, rx, sink));
    })
}

async fn run_synthesizer(
    stage: SynthesizerStage,
    mut rx: mpsc::Receiver<SentenceJob>,
    mut sink: Box<dyn AudioSink>,
) {
    loop {
        let job = tokio::select! {
            () = stage.cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // An interruption raised since the last job cancels everything
        // queued, including the job just dequeued.
        if stage.interrupt.load(Ordering::Relaxed) {
            cancel_playback(&mut sink, &mut rx, &stage.events);
            continue;
        }

        match job {
            SentenceJob::Speak {
                text,
                voice,
                interjection,
            } => {
                let audio = match synthesize_with_retry(&stage, &text, &voice).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        error!("TTS failed for sentence: {e}");
                        continue;
                    }
                };
                let chunk_samples = (u64::from(audio.sample_rate) * stage.chunk_ms / 1_000)
                    .max(1) as usize;

                for chunk in audio.samples.chunks(chunk_samples) {
                    if !interjection && stage.interrupt.load(Ordering::Relaxed) {
                        cancel_playback(&mut sink, &mut rx, &stage.events);
                        break;
                    }
                    if let Err(e) = sink.write(chunk, audio.sample_rate) {
                        error!("playback error: {e}");
                        break;
                    }
                }
            }
            SentenceJob::EndOfUtterance => {
                let _ = stage.events.send(Event::TtsFinished);
            }
        }
    }
}

/// Stop the device, drop everything still queued, and report the
/// cancellation exactly once.
fn cancel_playback(
    sink: &mut Box<dyn AudioSink>,
    rx: &mut mpsc::Receiver<SentenceJob>,
    events: &mpsc::UnboundedSender<Event>,
) {
    sink.stop();
    while rx.try_recv().is_ok() {}
    let _ = events.send(Event::TtsCancelled);
}

async fn synthesize_with_retry(
    stage: &SynthesizerStage,
    text: &str,
    voice: &str,
) -> std::result::Result<SynthesizedSpeech, TtsError> {
    let mut attempt = 1;
    loop {
        match stage.tts.synthesize(text, voice).await {
            Ok(audio) => return Ok(audio),
            Err(e) if e.is_retryable() && attempt < stage.retry.max_attempts => {
                warn!(attempt, "TTS transient failure, retrying: {e}");
                tokio::time::sleep(stage.retry.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
