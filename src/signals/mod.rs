//! Observation signal bus.
//!
//! A process-local registry of named listeners. Emission is synchronous on
//! the dispatcher thread, best-effort, and side-effect isolated: a
//! panicking listener is caught, logged, and discarded without disturbing
//! the other listeners or the reducer. Listeners must not perform long
//! I/O and must not re-enter the engine.

pub mod parse;

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Canonical framework signal names.
///
/// These are emitted from fixed points in the reducer and turn processor;
/// their payload shapes are part of the external contract. Custom signals
/// parsed out of generator replies carry the `custom.` prefix instead.
pub mod names {
    pub const VAD_SPEECH_STARTED: &str = "vad.speech_started";
    pub const VAD_SPEECH_ENDED: &str = "vad.speech_ended";
    pub const TTS_SPEAKING_STARTED: &str = "tts.speaking_started";
    pub const TTS_SPEAKING_FINISHED: &str = "tts.speaking_finished";
    pub const TTS_CANCELLED: &str = "tts.cancelled";
    pub const TURN_STARTED: &str = "turn.started";
    pub const TURN_COMPLETED: &str = "turn.completed";
    pub const SPEAKER_CHANGED: &str = "conversation.speaker_changed";
    pub const INTERRUPTED: &str = "conversation.interrupted";
    pub const SPEAKING_LIMIT_EXCEEDED: &str = "conversation.speaking_limit_exceeded";
    pub const PHASE_TRANSITION_TRIGGERED: &str = "phase.transition_triggered";
    pub const PHASE_TRANSITION_STARTED: &str = "phase.transition_started";
    pub const PHASE_TRANSITION_COMPLETE: &str = "phase.transition_complete";
    pub const PHASE_PROGRESS_UPDATED: &str = "phase.progress_updated";
    pub const LLM_GENERATION_STARTED: &str = "llm.generation_started";
    pub const LLM_GENERATION_COMPLETE: &str = "llm.generation_complete";
    pub const LLM_GENERATION_ERROR: &str = "llm.generation_error";
    pub const LLM_SIGNAL_RECEIVED: &str = "llm.signal_received";
    pub const LLM_SIGNAL_PARSE_FAILED: &str = "llm.signal_parse_failed";
    pub const ANALYTICS_TURN_LOGGED: &str = "analytics.turn_logged";
    pub const ANALYTICS_SESSION_SUMMARY: &str = "analytics.session_summary";
    pub const STATE_PHASE_CHANGED: &str = "state.phase_changed";
    pub const STATE_PARTIAL_TRANSCRIPT: &str = "state.partial_transcript";
    pub const STATE_AI_SPEAKING_CHANGED: &str = "state.ai_speaking_changed";
    pub const ENGINE_SHUTDOWN: &str = "engine.shutdown";

    /// Prefix applied to every signal parsed out of generator output.
    pub const CUSTOM_PREFIX: &str = "custom.";
}

type ListenerFn = dyn Fn(&str, &Value) + Send + Sync;

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Vec<Arc<ListenerFn>>>,
    any: Vec<Arc<ListenerFn>>,
}

/// Registry of named observers with per-listener failure isolation.
#[derive(Default)]
pub struct SignalBus {
    registry: RwLock<Registry>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one signal name.
    pub fn subscribe(&self, name: &str, listener: impl Fn(&str, &Value) + Send + Sync + 'static) {
        if let Ok(mut registry) = self.registry.write() {
            registry
                .by_name
                .entry(name.to_owned())
                .or_default()
                .push(Arc::new(listener));
        }
    }

    /// Register a listener for every signal.
    pub fn subscribe_all(&self, listener: impl Fn(&str, &Value) + Send + Sync + 'static) {
        if let Ok(mut registry) = self.registry.write() {
            registry.any.push(Arc::new(listener));
        }
    }

    /// Number of listeners that would observe `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.registry
            .read()
            .map(|r| r.any.len() + r.by_name.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Emit a signal to every matching listener, synchronously.
    ///
    /// Each listener runs inside its own failure boundary: a panic is
    /// caught, logged, and swallowed so the remaining listeners still run.
    pub fn emit(&self, name: &str, payload: &Value) {
        let listeners: Vec<Arc<ListenerFn>> = match self.registry.read() {
            Ok(registry) => registry
                .by_name
                .get(name)
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .cloned()
                .collect(),
            Err(_) => return,
        };

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(name, payload)));
            if outcome.is_err() {
                warn!(signal = name, "signal listener panicked; discarding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn named_and_wildcard_listeners_both_fire() {
        let bus = SignalBus::new();
        let named = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let named_clone = Arc::clone(&named);
        bus.subscribe(names::TURN_COMPLETED, move |_, _| {
            named_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = Arc::clone(&all);
        bus.subscribe_all(move |_, _| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(names::TURN_COMPLETED, &json!({"turn_id": 1}));
        bus.emit(names::VAD_SPEECH_STARTED, &json!({"turn_id": 2}));

        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = SignalBus::new();
        let survivors = Arc::new(AtomicUsize::new(0));

        bus.subscribe(names::INTERRUPTED, |_, _| {
            panic!("listener bug");
        });
        let survivors_clone = Arc::clone(&survivors);
        bus.subscribe(names::INTERRUPTED, move |_, _| {
            survivors_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(names::INTERRUPTED, &json!({"turn_id": 3, "reason": "voice"}));
        assert_eq!(survivors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_receives_name_and_payload() {
        let bus = SignalBus::new();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(names::SPEAKING_LIMIT_EXCEEDED, move |name, payload| {
            *seen_clone.lock().unwrap() = Some((name.to_owned(), payload.clone()));
        });

        let payload = json!({"turn_id": 4, "limit_sec": 5, "elapsed_sec": 6});
        bus.emit(names::SPEAKING_LIMIT_EXCEEDED, &payload);

        let got = seen.lock().unwrap().take().unwrap();
        assert_eq!(got.0, names::SPEAKING_LIMIT_EXCEEDED);
        assert_eq!(got.1["limit_sec"], 5);
    }
}
