//! Conversation state owned by the reducer.

use crate::engine::events::EndReason;
use crate::profile::{PhaseProfile, Profile};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Turn-taking phase. Exactly one at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    /// Nobody is speaking; waiting for voice.
    Idle,
    /// The human is actively speaking.
    HumanSpeaking,
    /// The human went quiet; waiting to see if the turn is over.
    HumanPausing,
    /// The captured utterance is being transcribed/generated.
    Processing,
    /// Synthesized speech is playing.
    AiSpeaking,
    /// Shutdown requested; draining workers.
    ShuttingDown,
}

impl ConversationPhase {
    /// Stable string form used in signal payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HumanSpeaking => "human_speaking",
            Self::HumanPausing => "human_pausing",
            Self::Processing => "processing",
            Self::AiSpeaking => "ai_speaking",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Analytics accumulator for the in-flight turn.
#[derive(Debug, Clone, Default)]
pub struct TurnMetrics {
    /// Turn id this accumulator belongs to.
    pub turn_id: u64,
    /// Why the turn ended, once known.
    pub end_reason: Option<EndReason>,
    /// The turn was abandoned before generation.
    pub skipped: bool,
    /// The human barged in over the reply.
    pub interrupted: bool,
    /// Final-transcription latency reported by the ASR collaborator.
    pub asr_latency_ms: Option<u64>,
    /// Generation latency reported with the final token.
    pub llm_latency_ms: Option<u64>,
    /// What the human said.
    pub user_text: String,
    /// What the AI said (signal blocks stripped).
    pub ai_text: String,
    /// Monotonic ms when the turn opened.
    pub started_ms: Option<u64>,
    /// Monotonic ms when the turn closed.
    pub completed_ms: Option<u64>,
    /// Whether generation has begun (guards the started signal).
    pub generation_started: bool,
}

impl TurnMetrics {
    /// Wall-clock duration of the turn, when both endpoints are known.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_ms, self.completed_ms) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }
}

/// The single monotonically updated value owned by the reducer.
///
/// Mutated only inside [`crate::engine::reducer::reduce`] (and by the
/// dispatcher's phase-entry rewrite); every other reader gets a
/// [`StateSnapshot`] copy.
#[derive(Debug, Clone)]
pub struct ConversationState {
    /// Current turn-taking phase.
    pub phase: ConversationPhase,
    /// Monotonically increasing turn counter; id of the in-flight turn.
    pub turn_id: u64,
    /// True while a turn is open (between turn start and completion).
    pub turn_active: bool,
    /// The mounted persona.
    pub active_profile: Arc<Profile>,
    /// The staged conversation plan, when one is mounted.
    pub phase_profile: Option<Arc<PhaseProfile>>,
    /// Id of the active stage within the plan.
    pub current_phase_id: Option<String>,
    /// Custom signals the generator has emitted in the current stage.
    pub emitted_signals: BTreeSet<String>,
    /// Number of stage transitions completed so far.
    pub phases_completed: u32,
    /// Monotonic ms when the current human speech began.
    pub speech_start_ms: Option<u64>,
    /// Monotonic ms of the last voiced frame.
    pub last_voice_ms: Option<u64>,
    /// Monotonic ms when the current turn opened.
    pub turn_start_ms: Option<u64>,
    /// Latest observed event time.
    pub now_ms: u64,
    /// Most recent streaming partial for the current human turn.
    pub partial_transcript: String,
    /// Captured samples of the current human turn.
    pub accumulated_audio: Vec<f32>,
    /// True between the first queued synthesis chunk and final playback.
    pub ai_speaking: bool,
    /// True when a human voice event during AI speech must preempt.
    pub interrupt_armed: bool,
    /// Guards the single-shot speaking-limit acknowledgment.
    pub ack_fired_this_turn: bool,
    /// Acknowledgment chosen this turn; becomes the processing ack prefix.
    pub pending_ack: Option<String>,
    /// Concession queued for after an accepted interruption settles.
    pub pending_concession: Option<String>,
    /// A non-empty partial has arrived since AI speech began.
    pub partial_since_ai_speech: bool,
    /// Consecutive voiced frames observed during AI speech.
    pub voiced_frames_during_ai: u8,
    /// Monotonic ms of the last accepted interruption (debounce anchor).
    pub last_interrupt_ms: Option<u64>,
    /// Analytics accumulator for the in-flight turn.
    pub turn_metrics: TurnMetrics,
    /// Seeded RNG for acknowledgment selection. Lives in the state so the
    /// reduction stays a pure function of `(state, event)`.
    pub ack_rng: SmallRng,
}

impl ConversationState {
    /// Initial state for a mounted profile (optionally inside a plan).
    pub fn new(
        profile: Arc<Profile>,
        phase_profile: Option<Arc<PhaseProfile>>,
        ack_seed: u64,
    ) -> Self {
        let current_phase_id = phase_profile.as_ref().map(|p| p.initial_phase.clone());
        Self {
            phase: ConversationPhase::Idle,
            turn_id: 0,
            turn_active: false,
            active_profile: profile,
            phase_profile,
            current_phase_id,
            emitted_signals: BTreeSet::new(),
            phases_completed: 0,
            speech_start_ms: None,
            last_voice_ms: None,
            turn_start_ms: None,
            now_ms: 0,
            partial_transcript: String::new(),
            accumulated_audio: Vec::new(),
            ai_speaking: false,
            interrupt_armed: false,
            ack_fired_this_turn: false,
            pending_ack: None,
            pending_concession: None,
            partial_since_ai_speech: false,
            voiced_frames_during_ai: 0,
            last_interrupt_ms: None,
            turn_metrics: TurnMetrics::default(),
            ack_rng: SmallRng::seed_from_u64(ack_seed),
        }
    }

    /// Serializable copy of the observable fields, published after every
    /// reduction.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            turn_id: self.turn_id,
            profile_name: self.active_profile.name.clone(),
            current_phase_id: self.current_phase_id.clone(),
            phases_completed: self.phases_completed,
            partial_transcript: self.partial_transcript.clone(),
            ai_speaking: self.ai_speaking,
            emitted_signals: self.emitted_signals.iter().cloned().collect(),
        }
    }
}

/// Immutable copy of the observable state, for the observation API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub phase: ConversationPhase,
    pub turn_id: u64,
    pub profile_name: String,
    pub current_phase_id: Option<String>,
    pub phases_completed: u32,
    pub partial_transcript: String,
    pub ai_speaking: bool,
    pub emitted_signals: Vec<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn snapshot_reflects_state() {
        let state = ConversationState::new(Arc::new(Profile::default()), None, 7);
        let snap = state.snapshot();
        assert_eq!(snap.phase, ConversationPhase::Idle);
        assert_eq!(snap.turn_id, 0);
        assert!(!snap.ai_speaking);
        assert!(snap.current_phase_id.is_none());
    }

    #[test]
    fn metrics_duration_requires_both_endpoints() {
        let mut metrics = TurnMetrics {
            started_ms: Some(1_000),
            ..TurnMetrics::default()
        };
        assert_eq!(metrics.duration_ms(), 0);
        metrics.completed_ms = Some(4_250);
        assert_eq!(metrics.duration_ms(), 3_250);
    }
}
