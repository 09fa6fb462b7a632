//! Events flowing into the reducer and actions flowing out of it.
//!
//! Every variant is closed: producers construct events, the reducer
//! matches on them exhaustively, and the dispatcher matches on actions the
//! same way. Timestamps are monotonic milliseconds stamped by the
//! producer; the reducer never reads a clock of its own.

use crate::engine::state::TurnMetrics;
use crate::providers::FailureKind;
use std::sync::Arc;

/// An input to the reducer. All events funnel through one FIFO queue, so
/// the global event order fully determines the state trajectory.
#[derive(Debug, Clone)]
pub enum Event {
    /// VAD rising edge: speech probability and energy both crossed.
    VadSpeechStart { now_ms: u64 },
    /// VAD falling edge after the hangover window.
    VadSpeechEnd { now_ms: u64 },
    /// One capture frame, emitted unconditionally while the mic runs.
    AudioFrame {
        samples: Arc<Vec<f32>>,
        rms: f32,
        now_ms: u64,
    },
    /// Streaming partial transcript for the in-flight human turn.
    AsrPartial { text: String },
    /// Final transcript for a processed turn.
    AsrFinal { text: String, latency_ms: u64 },
    /// One generated token.
    LlmToken { token: String },
    /// Generation finished; carries the full raw response text.
    LlmDone { full_text: String, latency_ms: u64 },
    /// Generation (or transcription) failed after retries.
    LlmError { kind: FailureKind },
    /// The synthesizer accepted a sentence for speaking.
    TtsStarted { sentence: String },
    /// All queued speech for the turn finished playing.
    TtsFinished,
    /// Playback was cancelled by an interruption.
    TtsCancelled,
    /// Periodic clock injection; drives all timeout decisions.
    Tick { now_ms: u64 },
    /// Stop the engine.
    Shutdown,
}

impl Event {
    /// The timestamp carried by timed events, if any.
    pub fn timestamp_ms(&self) -> Option<u64> {
        match self {
            Self::VadSpeechStart { now_ms }
            | Self::VadSpeechEnd { now_ms }
            | Self::AudioFrame { now_ms, .. }
            | Self::Tick { now_ms } => Some(*now_ms),
            _ => None,
        }
    }
}

/// Log level carried by [`Action::Log`]; the dispatcher maps it onto
/// `tracing` so the reducer itself stays I/O-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Natural silence after the end-of-turn window.
    Silence,
    /// The safety timeout fired under non-human authority.
    SafetyTimeout,
    /// The human barged in over AI speech.
    Interrupted,
    /// A collaborator failed after retries.
    Error,
    /// The transcript was empty; generation was skipped.
    Skipped,
}

impl EndReason {
    /// Stable string form used in signal payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::SafetyTimeout => "safety_timeout",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// An intent emitted by the reducer and executed by the dispatcher.
#[derive(Debug, Clone)]
pub enum Action {
    /// Forward a message to the logging layer.
    Log { level: LogLevel, message: String },
    /// Raise the interrupt flag and stop playback.
    InterruptAi,
    /// Speak a short interjection (speaking-limit acknowledgment or
    /// interruption concession) outside the normal turn flow.
    PlayAck { text: String },
    /// Run the streaming turn processor over the captured utterance.
    ProcessTurn {
        audio: Arc<Vec<f32>>,
        ack_prefix: Option<String>,
    },
    /// Run a generation-only turn with no user utterance (AI opens).
    GenerateAiGreeting,
    /// Publish a named observation on the signal bus.
    EmitSignal {
        name: String,
        payload: serde_json::Value,
    },
    /// Record the finished turn's analytics.
    LogTurn { metrics: TurnMetrics },
    /// Rewrite state for a phase transition.
    EnterPhase { phase_id: String },
}
