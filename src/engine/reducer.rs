//! The pure turn-taking state machine.
//!
//! [`reduce`] is referentially transparent: for a fixed
//! [`ReducerContext`], the same `(state, event)` always yields the same
//! `(state', actions)`. It performs no I/O, reads no clock (time arrives
//! inside events), and never logs directly; log lines travel out as
//! [`Action::Log`] entries for the dispatcher to forward.

use crate::config::{InterruptConfig, VadConfig};
use crate::engine::events::{Action, EndReason, Event, LogLevel};
use crate::engine::state::{ConversationPhase, ConversationState, TurnMetrics};
use crate::profile::Authority;
use crate::providers::FailureKind;
use crate::signals::names;
use crate::signals::parse;
use rand::Rng;
use serde_json::{Value, json};
use std::sync::Arc;

/// Concession spoken after an accepted interruption under mediated
/// authority.
const CONCESSION: &str = "Go ahead.";

/// Fixed parameters the reducer needs beyond the active profile.
#[derive(Debug, Clone)]
pub struct ReducerContext {
    pub vad: VadConfig,
    pub interrupt: InterruptConfig,
}

/// What kind of voice evidence triggered an interruption check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptTrigger {
    SpeechStart,
    Frame,
}

/// Apply one event to the state, returning the side effects to perform.
pub fn reduce(ctx: &ReducerContext, state: &mut ConversationState, event: &Event) -> Vec<Action> {
    let mut actions = Vec::new();

    if let Some(ts) = event.timestamp_ms() {
        state.now_ms = state.now_ms.max(ts);
    }
    if state.phase == ConversationPhase::ShuttingDown {
        return actions;
    }

    match event {
        Event::Tick { now_ms } => on_tick(state, *now_ms, &mut actions),
        Event::VadSpeechStart { now_ms } => on_speech_start(ctx, state, *now_ms, &mut actions),
        Event::VadSpeechEnd { now_ms } => {
            actions.push(emit(
                names::VAD_SPEECH_ENDED,
                json!({"ts_ms": now_ms, "turn_id": state.turn_id}),
            ));
        }
        Event::AudioFrame {
            samples,
            rms,
            now_ms,
        } => on_audio_frame(ctx, state, samples, *rms, *now_ms, &mut actions),
        Event::AsrPartial { text } => on_asr_partial(state, text, &mut actions),
        Event::AsrFinal { text, latency_ms } => {
            on_asr_final(state, text, *latency_ms, &mut actions);
        }
        Event::LlmToken { .. } => on_llm_token(state, &mut actions),
        Event::LlmDone {
            full_text,
            latency_ms,
        } => on_llm_done(state, full_text, *latency_ms, &mut actions),
        Event::LlmError { kind } => on_llm_error(state, *kind, &mut actions),
        Event::TtsStarted { sentence } => on_tts_started(state, sentence, &mut actions),
        Event::TtsFinished => on_tts_finished(state, &mut actions),
        Event::TtsCancelled => on_tts_cancelled(state, &mut actions),
        Event::Shutdown => {
            set_phase(state, ConversationPhase::ShuttingDown, &mut actions);
            actions.push(emit(
                names::ENGINE_SHUTDOWN,
                json!({"turn_id": state.turn_id}),
            ));
            actions.push(log(LogLevel::Info, "shutdown requested".to_owned()));
        }
    }

    actions
}

// ── event handlers ──────────────────────────────────────────────────

fn on_tick(state: &mut ConversationState, now: u64, actions: &mut Vec<Action>) {
    let profile = Arc::clone(&state.active_profile);
    let timing = profile.timing;

    match state.phase {
        ConversationPhase::HumanSpeaking => {
            let speech_start = state.speech_start_ms.unwrap_or(now);
            let last_voice = state.last_voice_ms.unwrap_or(now);

            // Run-on turns are cut by the safety cap unless the human
            // holds authority.
            if profile.authority != Authority::Human
                && now.saturating_sub(speech_start) >= timing.safety_timeout_ms
            {
                finish_capture(state, EndReason::SafetyTimeout, actions);
                return;
            }

            let silence = now.saturating_sub(last_voice);
            if silence >= timing.pause_ms {
                set_phase(state, ConversationPhase::HumanPausing, actions);
                // One tick may cover both windows when ticks are sparse.
                if silence >= timing.end_ms {
                    finish_capture(state, EndReason::Silence, actions);
                }
                return;
            }

            if let Some(limit_sec) = profile.speaking_limit_sec
                && profile.authority != Authority::Human
                && !state.ack_fired_this_turn
            {
                let elapsed_ms = now.saturating_sub(speech_start);
                if elapsed_ms >= limit_sec.saturating_mul(1_000) {
                    let ack = choose_ack(state, &profile.acknowledgments);
                    state.ack_fired_this_turn = true;
                    state.pending_ack = Some(ack.clone());
                    actions.push(emit(
                        names::SPEAKING_LIMIT_EXCEEDED,
                        json!({
                            "turn_id": state.turn_id,
                            "limit_sec": limit_sec,
                            "elapsed_sec": elapsed_ms / 1_000,
                        }),
                    ));
                    actions.push(Action::PlayAck { text: ack });
                }
            }
        }
        ConversationPhase::HumanPausing => {
            let last_voice = state.last_voice_ms.unwrap_or(now);
            if now.saturating_sub(last_voice) >= timing.end_ms {
                finish_capture(state, EndReason::Silence, actions);
            }
        }
        _ => {}
    }
}

fn on_speech_start(
    ctx: &ReducerContext,
    state: &mut ConversationState,
    now: u64,
    actions: &mut Vec<Action>,
) {
    if state.ai_speaking {
        try_interrupt(ctx, state, now, InterruptTrigger::SpeechStart, actions);
        return;
    }
    match state.phase {
        ConversationPhase::Idle => open_human_turn(state, now, actions),
        ConversationPhase::HumanPausing => {
            state.last_voice_ms = Some(now);
            set_phase(state, ConversationPhase::HumanSpeaking, actions);
        }
        ConversationPhase::HumanSpeaking => {
            state.last_voice_ms = Some(now);
        }
        _ => {}
    }
}

fn on_audio_frame(
    ctx: &ReducerContext,
    state: &mut ConversationState,
    samples: &Arc<Vec<f32>>,
    rms: f32,
    now: u64,
    actions: &mut Vec<Action>,
) {
    let voiced = rms > ctx.vad.energy_floor;

    if state.ai_speaking {
        if voiced {
            state.voiced_frames_during_ai = state.voiced_frames_during_ai.saturating_add(1);
        } else {
            state.voiced_frames_during_ai = 0;
        }
        try_interrupt(ctx, state, now, InterruptTrigger::Frame, actions);
        return;
    }

    match state.phase {
        ConversationPhase::HumanSpeaking => {
            if voiced {
                state.last_voice_ms = Some(now);
            }
            state.accumulated_audio.extend_from_slice(samples);
        }
        ConversationPhase::HumanPausing => {
            state.accumulated_audio.extend_from_slice(samples);
            if voiced {
                state.last_voice_ms = Some(now);
                set_phase(state, ConversationPhase::HumanSpeaking, actions);
            }
        }
        // Idle room noise and late frames during processing are dropped.
        _ => {}
    }
}

fn on_asr_partial(state: &mut ConversationState, text: &str, actions: &mut Vec<Action>) {
    state.partial_transcript = text.to_owned();
    if state.ai_speaking && !text.trim().is_empty() {
        state.partial_since_ai_speech = true;
    }
    actions.push(emit(
        names::STATE_PARTIAL_TRANSCRIPT,
        json!({"text": text, "turn_id": state.turn_id}),
    ));
}

fn on_asr_final(
    state: &mut ConversationState,
    text: &str,
    latency_ms: u64,
    actions: &mut Vec<Action>,
) {
    if !state.turn_active || state.phase != ConversationPhase::Processing {
        return;
    }
    state.turn_metrics.asr_latency_ms = Some(latency_ms);
    state.turn_metrics.user_text = text.to_owned();

    if text.trim().is_empty() {
        state.turn_metrics.skipped = true;
        state.turn_metrics.end_reason = Some(EndReason::Skipped);
        actions.push(log(
            LogLevel::Info,
            format!("turn {}: empty transcript, skipping generation", state.turn_id),
        ));
        complete_turn(state, actions);
        set_phase(state, ConversationPhase::Idle, actions);
    }
}

fn on_llm_token(state: &mut ConversationState, actions: &mut Vec<Action>) {
    // A greeting generation opens its own turn: tokens arrive while idle
    // with no human capture preceding them.
    if !state.turn_active && state.phase == ConversationPhase::Idle && !state.ai_speaking {
        open_ai_turn(state, actions);
    }
    if state.turn_active && !state.turn_metrics.generation_started {
        state.turn_metrics.generation_started = true;
        actions.push(emit(
            names::LLM_GENERATION_STARTED,
            json!({"turn_id": state.turn_id}),
        ));
    }
}

fn on_llm_done(
    state: &mut ConversationState,
    full_text: &str,
    latency_ms: u64,
    actions: &mut Vec<Action>,
) {
    if !state.turn_active {
        return;
    }
    state.turn_metrics.llm_latency_ms = Some(latency_ms);
    state.turn_metrics.ai_text = parse::spoken_text(full_text);
    actions.push(emit(
        names::LLM_GENERATION_COMPLETE,
        json!({"turn_id": state.turn_id, "latency_ms": latency_ms}),
    ));

    let parsed = parse::parse_signal_blocks(full_text);
    for _ in 0..parsed.failed_blocks {
        actions.push(emit(
            names::LLM_SIGNAL_PARSE_FAILED,
            json!({"turn_id": state.turn_id}),
        ));
    }
    for (name, payload) in parsed.signals {
        let prefixed = format!("{}{}", names::CUSTOM_PREFIX, name);
        state.emitted_signals.insert(prefixed.clone());
        actions.push(emit(
            names::LLM_SIGNAL_RECEIVED,
            json!({"name": prefixed, "turn_id": state.turn_id}),
        ));
        actions.push(Action::EmitSignal {
            name: prefixed,
            payload,
        });
    }
}

fn on_llm_error(state: &mut ConversationState, kind: FailureKind, actions: &mut Vec<Action>) {
    actions.push(emit(
        names::LLM_GENERATION_ERROR,
        json!({"kind": kind.as_str(), "turn_id": state.turn_id}),
    ));
    if state.turn_active {
        state.turn_metrics.end_reason = Some(EndReason::Error);
        actions.push(log(
            LogLevel::Warn,
            format!("turn {} abandoned ({})", state.turn_id, kind.as_str()),
        ));
        complete_turn(state, actions);
        set_phase(state, ConversationPhase::Idle, actions);
    }
}

fn on_tts_started(state: &mut ConversationState, sentence: &str, actions: &mut Vec<Action>) {
    if !state.ai_speaking {
        if !state.turn_active {
            open_ai_turn(state, actions);
        }
        state.ai_speaking = true;
        state.partial_since_ai_speech = false;
        state.voiced_frames_during_ai = 0;
        state.interrupt_armed = state.active_profile.authority != Authority::Ai;
        set_phase(state, ConversationPhase::AiSpeaking, actions);
        actions.push(emit(
            names::STATE_AI_SPEAKING_CHANGED,
            json!({"ai_speaking": true, "turn_id": state.turn_id}),
        ));
        actions.push(emit(
            names::SPEAKER_CHANGED,
            json!({"speaker": "ai", "turn_id": state.turn_id}),
        ));
        let preview: String = sentence.chars().take(48).collect();
        actions.push(emit(
            names::TTS_SPEAKING_STARTED,
            json!({"text_preview": preview, "turn_id": state.turn_id}),
        ));
    }
}

fn on_tts_finished(state: &mut ConversationState, actions: &mut Vec<Action>) {
    if !state.turn_active {
        return;
    }
    if matches!(
        state.phase,
        ConversationPhase::AiSpeaking | ConversationPhase::Processing | ConversationPhase::Idle
    ) {
        actions.push(emit(
            names::TTS_SPEAKING_FINISHED,
            json!({"turn_id": state.turn_id}),
        ));
        complete_turn(state, actions);
        set_phase(state, ConversationPhase::Idle, actions);
    }
}

fn on_tts_cancelled(state: &mut ConversationState, actions: &mut Vec<Action>) {
    actions.push(emit(
        names::TTS_CANCELLED,
        json!({"turn_id": state.turn_id}),
    ));
    if let Some(text) = state.pending_concession.take() {
        actions.push(Action::PlayAck { text });
    }
}

// ── interruption ────────────────────────────────────────────────────

fn try_interrupt(
    ctx: &ReducerContext,
    state: &mut ConversationState,
    now: u64,
    trigger: InterruptTrigger,
    actions: &mut Vec<Action>,
) {
    if !state.interrupt_armed {
        return;
    }
    let profile = Arc::clone(&state.active_profile);
    let spike = state.voiced_frames_during_ai >= ctx.interrupt.energy_spike_frames;

    let accepted = match profile.authority {
        Authority::Ai => false,
        Authority::Human => trigger == InterruptTrigger::SpeechStart || spike,
        Authority::Default => {
            let sensitivity = profile.interruption_sensitivity;
            if sensitivity <= 0.0 {
                state.partial_since_ai_speech
            } else if sensitivity >= 1.0 {
                spike
            } else {
                spike || state.partial_since_ai_speech
            }
        }
    };
    if !accepted {
        return;
    }
    if let Some(last) = state.last_interrupt_ms
        && now.saturating_sub(last) < ctx.interrupt.debounce_ms
    {
        return;
    }
    state.last_interrupt_ms = Some(now);

    actions.push(Action::InterruptAi);
    actions.push(emit(
        names::INTERRUPTED,
        json!({"turn_id": state.turn_id, "reason": interrupt_reason(trigger)}),
    ));
    actions.push(log(
        LogLevel::Info,
        format!("turn {} interrupted by human voice", state.turn_id),
    ));

    state.turn_metrics.interrupted = true;
    state.turn_metrics.end_reason = Some(EndReason::Interrupted);
    complete_turn(state, actions);

    if profile.authority == Authority::Default {
        state.pending_concession = Some(CONCESSION.to_owned());
    }

    // The interrupting voice opens the next human turn immediately.
    open_human_turn(state, now, actions);
}

fn interrupt_reason(trigger: InterruptTrigger) -> &'static str {
    match trigger {
        InterruptTrigger::SpeechStart => "speech_start",
        InterruptTrigger::Frame => "energy",
    }
}

// ── turn lifecycle ──────────────────────────────────────────────────

fn open_human_turn(state: &mut ConversationState, now: u64, actions: &mut Vec<Action>) {
    state.turn_id += 1;
    state.turn_active = true;
    state.turn_start_ms = Some(now);
    state.speech_start_ms = Some(now);
    state.last_voice_ms = Some(now);
    state.ack_fired_this_turn = false;
    state.pending_ack = None;
    state.partial_transcript.clear();
    state.accumulated_audio.clear();
    state.turn_metrics = TurnMetrics {
        turn_id: state.turn_id,
        started_ms: Some(now),
        ..TurnMetrics::default()
    };
    set_phase(state, ConversationPhase::HumanSpeaking, actions);
    actions.push(emit(
        names::TURN_STARTED,
        json!({"turn_id": state.turn_id, "ts_ms": now}),
    ));
    actions.push(emit(
        names::VAD_SPEECH_STARTED,
        json!({"ts_ms": now, "turn_id": state.turn_id}),
    ));
    actions.push(emit(
        names::SPEAKER_CHANGED,
        json!({"speaker": "human", "turn_id": state.turn_id}),
    ));
}

fn open_ai_turn(state: &mut ConversationState, actions: &mut Vec<Action>) {
    state.turn_id += 1;
    state.turn_active = true;
    state.turn_start_ms = Some(state.now_ms);
    state.turn_metrics = TurnMetrics {
        turn_id: state.turn_id,
        started_ms: Some(state.now_ms),
        ..TurnMetrics::default()
    };
    actions.push(emit(
        names::TURN_STARTED,
        json!({"turn_id": state.turn_id, "ts_ms": state.now_ms}),
    ));
}

fn finish_capture(state: &mut ConversationState, reason: EndReason, actions: &mut Vec<Action>) {
    state.turn_metrics.end_reason = Some(reason);
    set_phase(state, ConversationPhase::Processing, actions);
    let audio = Arc::new(std::mem::take(&mut state.accumulated_audio));
    let ack_prefix = state.pending_ack.take();
    actions.push(log(
        LogLevel::Info,
        format!(
            "turn {} capture ended ({}, {} samples)",
            state.turn_id,
            reason.as_str(),
            audio.len()
        ),
    ));
    actions.push(Action::ProcessTurn { audio, ack_prefix });
}

fn complete_turn(state: &mut ConversationState, actions: &mut Vec<Action>) {
    state.turn_metrics.completed_ms = Some(state.now_ms);
    if state.ai_speaking {
        state.ai_speaking = false;
        actions.push(emit(
            names::STATE_AI_SPEAKING_CHANGED,
            json!({"ai_speaking": false, "turn_id": state.turn_id}),
        ));
    }
    state.interrupt_armed = false;
    state.turn_active = false;
    state.partial_transcript.clear();

    let metrics = state.turn_metrics.clone();
    actions.push(emit(
        names::TURN_COMPLETED,
        json!({
            "turn_id": metrics.turn_id,
            "end_reason": metrics
                .end_reason
                .map_or("completed", EndReason::as_str),
            "duration_ms": metrics.duration_ms(),
            "latency_ms": metrics.llm_latency_ms.unwrap_or(0),
            "user_text": metrics.user_text,
            "ai_text": metrics.ai_text,
        }),
    ));
    actions.push(Action::LogTurn {
        metrics: state.turn_metrics.clone(),
    });
}

// ── helpers ─────────────────────────────────────────────────────────

fn choose_ack(state: &mut ConversationState, acknowledgments: &[String]) -> String {
    let idx = state.ack_rng.gen_range(0..acknowledgments.len());
    acknowledgments[idx].clone()
}

fn set_phase(state: &mut ConversationState, next: ConversationPhase, actions: &mut Vec<Action>) {
    if state.phase != next {
        let from = state.phase;
        state.phase = next;
        actions.push(emit(
            names::STATE_PHASE_CHANGED,
            json!({"from": from.as_str(), "to": next.as_str()}),
        ));
    }
}

fn emit(name: &str, payload: Value) -> Action {
    Action::EmitSignal {
        name: name.to_owned(),
        payload,
    }
}

fn log(level: LogLevel, message: String) -> Action {
    Action::Log { level, message }
}
