//! Engine assembly: producers, dispatcher, and the process control
//! surface.

pub mod dispatcher;
pub mod events;
pub mod phase;
pub mod prompt;
pub mod reducer;
pub mod state;
pub mod turn;

use crate::analytics::SessionAnalytics;
use crate::audio::capture::CpalCapture;
use crate::audio::playback::{
    AudioSink, CpalSink, SentenceJob, SynthesizerStage, spawn_synthesizer,
};
use crate::audio::vad::{VadProducer, run_vad_stage};
use crate::audio::AudioChunk;
use crate::config::EngineConfig;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::events::Event;
use crate::engine::phase::PhaseController;
use crate::engine::reducer::ReducerContext;
use crate::engine::state::{ConversationState, StateSnapshot};
use crate::error::{EngineError, Result};
use crate::memory::ConversationMemory;
use crate::profile::{PhaseProfile, Profile};
use crate::providers::{LanguageModel, SpeechToText, TextToSpeech, VoiceActivityModel};
use crate::signals::SignalBus;
use futures_util::StreamExt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const SENTENCE_CHANNEL_SIZE: usize = 16;
const AUDIO_CHANNEL_SIZE: usize = 64;

/// Monotonic clock shared by every producer; milliseconds since engine
/// construction.
#[derive(Debug, Clone)]
pub struct EngineClock {
    origin: Instant,
}

impl EngineClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Monotonic milliseconds since engine start.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The persona mounted at engine start.
pub enum PersonaMount {
    /// A single fixed persona.
    Profile(Profile),
    /// A staged plan whose transitions are signal-driven.
    Phases(PhaseProfile),
}

/// External collaborator bundle.
pub struct Collaborators {
    pub asr: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

/// The single-conversation engine.
///
/// Construct with [`ConversationEngine::new`], optionally attach a
/// microphone and an audio sink, register signal listeners through
/// [`signals`](Self::signals), grab an [`EngineHandle`] for event
/// injection and observation, then [`run`](Self::run) to completion.
pub struct ConversationEngine {
    config: EngineConfig,
    state: ConversationState,
    plan: Option<Arc<PhaseProfile>>,
    collaborators: Collaborators,
    bus: Arc<SignalBus>,
    clock: EngineClock,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    snapshot_tx: watch::Sender<StateSnapshot>,
    snapshot_rx: watch::Receiver<StateSnapshot>,
    cancel: CancellationToken,
    microphone: Option<Box<dyn VoiceActivityModel>>,
    sink: Option<Box<dyn AudioSink>>,
}

impl ConversationEngine {
    /// Create an engine over the given persona and collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the persona fails validation.
    pub fn new(
        config: EngineConfig,
        mount: PersonaMount,
        collaborators: Collaborators,
    ) -> Result<Self> {
        match &mount {
            PersonaMount::Profile(profile) => profile.validate()?,
            PersonaMount::Phases(plan) => plan.validate()?,
        }

        let (profile, plan) = match mount {
            PersonaMount::Profile(profile) => (profile, None),
            PersonaMount::Phases(plan) => {
                let plan = Arc::new(plan);
                let profile = plan
                    .phase(&plan.initial_phase)
                    .map(|spec| spec.profile.clone())
                    .unwrap_or_default();
                (profile, Some(plan))
            }
        };
        let seed = config.ack_seed.unwrap_or_else(rand::random);
        let state = ConversationState::new(Arc::new(profile), plan.clone(), seed);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());

        Ok(Self {
            config,
            state,
            plan,
            collaborators,
            bus: Arc::new(SignalBus::new()),
            clock: EngineClock::new(),
            events_tx,
            events_rx,
            snapshot_tx,
            snapshot_rx,
            cancel: CancellationToken::new(),
            microphone: None,
            sink: None,
        })
    }

    /// Attach a VAD model and enable microphone capture.
    pub fn with_microphone(mut self, model: Box<dyn VoiceActivityModel>) -> Self {
        self.microphone = Some(model);
        self
    }

    /// Replace the speaker output (the harness and tests use
    /// [`crate::audio::playback::NullSink`]).
    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The engine's signal bus, for listener registration.
    pub fn signals(&self) -> Arc<SignalBus> {
        Arc::clone(&self.bus)
    }

    /// Handle for event injection and state observation.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            events: self.events_tx.clone(),
            snapshot_rx: self.snapshot_rx.clone(),
            bus: Arc::clone(&self.bus),
            clock: self.clock.clone(),
        }
    }

    /// Run the conversation to completion.
    ///
    /// Returns `Ok(())` on clean shutdown (a [`Event::Shutdown`] was
    /// processed) and an error when a collaborator failed unrecoverably,
    /// such as losing the audio device.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on unrecoverable failure.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            state,
            plan,
            collaborators,
            bus,
            clock,
            events_tx,
            events_rx,
            snapshot_tx,
            snapshot_rx: _,
            cancel,
            microphone,
            sink,
        } = self;

        let fatal: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));
        let phase_controller = plan.map(PhaseController::new);

        let interrupt = Arc::new(AtomicBool::new(false));
        let assistant_speaking = Arc::new(AtomicBool::new(false));
        let (sentences_tx, sentences_rx) = mpsc::channel::<SentenceJob>(SENTENCE_CHANNEL_SIZE);

        // Tick producer.
        if config.tick_interval_ms > 0 {
            let tick_events = events_tx.clone();
            let tick_clock = clock.clone();
            let tick_cancel = cancel.clone();
            let interval_ms = config.tick_interval_ms;
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
                loop {
                    tokio::select! {
                        () = tick_cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if tick_events
                                .send(Event::Tick { now_ms: tick_clock.now_ms() })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Streaming partial transcripts, when the backend offers them.
        if let Some(mut partials) = collaborators.asr.partial_stream() {
            let partial_events = events_tx.clone();
            let partial_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = partial_cancel.cancelled() => break,
                        item = partials.next() => {
                            let Some(text) = item else { break };
                            if partial_events.send(Event::AsrPartial { text }).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Microphone capture + VAD producer.
        if let Some(model) = microphone {
            let capture = CpalCapture::new(&config.audio)?;
            let (audio_tx, audio_rx) = mpsc::channel::<AudioChunk>(AUDIO_CHANNEL_SIZE);
            let capture_clock = clock.clone();
            let capture_cancel = cancel.clone();
            let capture_fatal = Arc::clone(&fatal);
            let capture_events = events_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = capture.run(audio_tx, capture_clock, capture_cancel).await {
                    error!("audio capture failed: {e}");
                    if let Ok(mut slot) = capture_fatal.lock() {
                        *slot = Some(e);
                    }
                    let _ = capture_events.send(Event::Shutdown);
                }
            });

            let producer = VadProducer::new(model, config.vad.clone(), config.audio.input_sample_rate);
            let vad_events = events_tx.clone();
            let vad_cancel = cancel.clone();
            tokio::spawn(async move {
                run_vad_stage(audio_rx, vad_events, producer, vad_cancel).await;
            });
        }

        // Synthesizer.
        let sink: Box<dyn AudioSink> = match sink {
            Some(sink) => sink,
            None => Box::new(CpalSink::new(
                config.audio.output_device.as_deref(),
                config.audio.output_sample_rate,
            )?),
        };
        let synth_handle = spawn_synthesizer(
            SynthesizerStage {
                tts: Arc::clone(&collaborators.tts),
                chunk_ms: config.audio.playback_chunk_ms,
                retry: config.retry.clone(),
                events: events_tx.clone(),
                interrupt: Arc::clone(&interrupt),
                cancel: cancel.clone(),
            },
            sentences_rx,
            sink,
        );

        // Dispatcher owns the state and runs on this task.
        let reducer_ctx = ReducerContext {
            vad: config.vad.clone(),
            interrupt: config.interrupt.clone(),
        };
        let dispatcher = Dispatcher {
            state,
            reducer_ctx,
            bus,
            memory: Arc::new(Mutex::new(ConversationMemory::new(
                config.memory_max_messages,
            ))),
            analytics: SessionAnalytics::new(),
            phase_controller,
            events_rx,
            events_tx: events_tx.clone(),
            sentences_tx,
            interrupt,
            assistant_speaking,
            snapshot_tx,
            cancel: cancel.clone(),
            turn_cancel: cancel.child_token(),
            asr: Arc::clone(&collaborators.asr),
            llm: Arc::clone(&collaborators.llm),
            pending_greeting: false,
            config,
        };

        info!("conversation engine running");
        dispatcher.run().await;

        // Stop every producer and drain the synthesizer.
        cancel.cancel();
        let _ = synth_handle.await;

        match fatal.lock().ok().and_then(|mut slot| slot.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Injected observation and control handle.
///
/// Cheap to clone; the embedding layer passes this around instead of any
/// process-global engine reference.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::UnboundedSender<Event>,
    snapshot_rx: watch::Receiver<StateSnapshot>,
    bus: Arc<SignalBus>,
    clock: EngineClock,
}

impl EngineHandle {
    /// Enqueue an event onto the engine's queue.
    pub fn inject(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Request a clean shutdown.
    pub fn shutdown(&self) {
        self.inject(Event::Shutdown);
    }

    /// Latest published state snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A watch receiver that updates after every reduction.
    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot_rx.clone()
    }

    /// The engine's signal bus.
    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    /// The engine's monotonic clock, for stamping injected events.
    pub fn clock(&self) -> &EngineClock {
        &self.clock
    }
}
