//! Scripted end-to-end harness.
//!
//! Runs the full engine against scripted collaborators (no microphone,
//! no speakers, no model weights), driving one human turn through
//! transcription, generation, and synthesis, then a signal-driven phase
//! transition with an AI greeting, then a clean shutdown. Prints the
//! observed signal trace. Exits 0 on clean shutdown, non-zero otherwise.
//!
//! ```sh
//! RUST_LOG=info cargo run --bin colloquy-harness
//! ```

use async_trait::async_trait;
use colloquy::audio::playback::NullSink;
use colloquy::engine::EngineClock;
use colloquy::profile::{PhaseSpec, PhaseTransition, Speaker};
use colloquy::providers::{
    AsrError, GenerationRequest, LanguageModel, LlmError, SpeechToText, SynthesizedSpeech,
    TextToSpeech, TokenStream, Transcript, TtsError,
};
use colloquy::{
    Collaborators, ConversationEngine, ConversationPhase, EngineConfig, EngineHandle, Event,
    PersonaMount, PhaseProfile, Profile,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ASR that replays a fixed list of transcripts.
struct ScriptedAsr {
    lines: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl SpeechToText for ScriptedAsr {
    async fn transcribe(
        &self,
        _samples: &[f32],
        _sample_rate: u32,
    ) -> Result<Transcript, AsrError> {
        let text = self
            .lines
            .lock()
            .map_err(|_| AsrError::permanent("script lock poisoned"))?
            .pop_front()
            .unwrap_or("");
        Ok(Transcript {
            text: text.to_owned(),
            latency_ms: 42,
        })
    }
}

/// LLM that streams fixed replies word by word.
struct ScriptedLlm {
    replies: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn stream(&self, _request: GenerationRequest) -> Result<TokenStream, LlmError> {
        let reply = self
            .replies
            .lock()
            .map_err(|_| LlmError::permanent("script lock poisoned"))?
            .pop_front()
            .unwrap_or("I have nothing to add.");
        let stream = async_stream::stream! {
            for word in reply.split_inclusive(' ') {
                tokio::time::sleep(Duration::from_millis(2)).await;
                yield Ok(word.to_owned());
            }
        };
        Ok(Box::pin(stream))
    }
}

/// TTS that fabricates one millisecond of silence per character.
struct ScriptedTts;

#[async_trait]
impl TextToSpeech for ScriptedTts {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<SynthesizedSpeech, TtsError> {
        Ok(SynthesizedSpeech {
            samples: vec![0.0; text.len().max(1) * 24],
            sample_rate: 24_000,
        })
    }
}

fn interview_plan() -> PhaseProfile {
    let intake = Profile {
        name: "intake".to_owned(),
        voice: "warm".to_owned(),
        instructions: "Collect what the caller needs, then wrap up.".to_owned(),
        custom_signals: [(
            "intake.done".to_owned(),
            "the caller has said everything they came to say".to_owned(),
        )]
        .into_iter()
        .collect(),
        ..Profile::default()
    };
    let assessment = Profile {
        name: "assessment".to_owned(),
        voice: "crisp".to_owned(),
        initial_speaker: Speaker::Ai,
        instructions: "Walk the caller through the assessment.".to_owned(),
        ..Profile::default()
    };

    PhaseProfile {
        name: "interview".to_owned(),
        initial_phase: "intake".to_owned(),
        global_context: "This is a structured intake interview.".to_owned(),
        phases: vec![
            PhaseSpec {
                id: "intake".to_owned(),
                profile: intake,
                context: "Ask for the caller's situation.".to_owned(),
            },
            PhaseSpec {
                id: "assessment".to_owned(),
                profile: assessment,
                context: "Score the caller's answers.".to_owned(),
            },
        ],
        transitions: vec![PhaseTransition {
            from: "intake".to_owned(),
            to: "assessment".to_owned(),
            trigger_signals: vec!["custom.intake.done".to_owned()],
            require_all: false,
        }],
    }
}

/// Inject one spoken human turn: a speech edge, voiced frames, then the
/// silence that ends the turn.
fn inject_turn(handle: &EngineHandle, clock: &EngineClock) {
    let base = clock.now_ms();
    handle.inject(Event::VadSpeechStart { now_ms: base });
    for i in 0..40 {
        handle.inject(Event::AudioFrame {
            samples: Arc::new(vec![0.3; 512]),
            rms: 0.3,
            now_ms: base + i * 25,
        });
    }
    handle.inject(Event::VadSpeechEnd {
        now_ms: base + 1_000,
    });
    handle.inject(Event::Tick {
        now_ms: base + 2_200,
    });
}

/// Poll the snapshot until `predicate` holds or the timeout elapses.
async fn wait_for(
    handle: &EngineHandle,
    what: &str,
    predicate: impl Fn(&colloquy::StateSnapshot) -> bool,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate(&handle.snapshot()) {
            return Ok(());
        }
        if std::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}: {:?}", handle.snapshot());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let collaborators = Collaborators {
        asr: Arc::new(ScriptedAsr {
            lines: Mutex::new(VecDeque::from([
                "That covers everything I wanted to mention.",
            ])),
        }),
        llm: Arc::new(ScriptedLlm {
            replies: Mutex::new(VecDeque::from([
                "Thanks, that is clear. <signals>{\"intake.done\": {\"confidence\": 0.95}}</signals>",
                "Welcome to the assessment. Let's begin with the first question.",
            ])),
        }),
        tts: Arc::new(ScriptedTts),
    };

    let config = EngineConfig {
        // The harness drives time itself via injected ticks.
        tick_interval_ms: 0,
        ack_seed: Some(7),
        ..EngineConfig::default()
    };

    let engine = ConversationEngine::new(
        config,
        PersonaMount::Phases(interview_plan()),
        collaborators,
    )?
    .with_audio_sink(Box::new(NullSink));

    let handle = engine.handle();
    let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let trace_writer = Arc::clone(&trace);
    engine.signals().subscribe_all(move |name, _payload| {
        if let Ok(mut t) = trace_writer.lock() {
            t.push(name.to_owned());
        }
    });

    let clock = handle.clock().clone();
    let run = tokio::spawn(engine.run());

    // One human turn in the intake phase; the scripted reply carries the
    // signal that drives the transition into the assessment phase, whose
    // profile opens with an AI greeting.
    inject_turn(&handle, &clock);
    wait_for(&handle, "phase transition and greeting", |snap| {
        snap.current_phase_id.as_deref() == Some("assessment")
            && snap.phase == ConversationPhase::Idle
            && !snap.ai_speaking
            && snap.turn_id >= 2
    })
    .await?;

    handle.shutdown();
    run.await??;

    let trace = trace.lock().map(|t| t.clone()).unwrap_or_default();
    info!("observed {} signals", trace.len());
    println!("signal trace:");
    for name in &trace {
        println!("  {name}");
    }

    for expected in [
        "turn.started",
        "llm.signal_received",
        "custom.intake.done",
        "phase.transition_complete",
        "analytics.session_summary",
    ] {
        anyhow::ensure!(
            trace.iter().any(|n| n == expected),
            "missing expected signal {expected}"
        );
    }

    println!("clean shutdown");
    Ok(())
}
