//! The single-consumer event loop.
//!
//! Pulls exactly one event at a time off the queue, runs the reducer,
//! publishes a state snapshot, then executes each returned action in
//! order. Long work (turn processing, greetings) is dispatched to worker
//! tasks; the loop itself never blocks on collaborators. This gives a
//! total order over all state transitions.

use crate::analytics::SessionAnalytics;
use crate::audio::playback::SentenceJob;
use crate::config::EngineConfig;
use crate::engine::events::{Action, Event, LogLevel};
use crate::engine::phase::{PhaseController, progress_pct};
use crate::engine::reducer::{ReducerContext, reduce};
use crate::engine::state::{ConversationState, StateSnapshot};
use crate::engine::turn::TurnRunner;
use crate::memory::ConversationMemory;
use crate::profile::Speaker;
use crate::providers::{LanguageModel, SpeechToText};
use crate::signals::{SignalBus, names};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct Dispatcher {
    pub config: EngineConfig,
    pub state: ConversationState,
    pub reducer_ctx: ReducerContext,
    pub bus: Arc<SignalBus>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub analytics: SessionAnalytics,
    pub phase_controller: Option<PhaseController>,
    pub events_rx: mpsc::UnboundedReceiver<Event>,
    pub events_tx: mpsc::UnboundedSender<Event>,
    pub sentences_tx: mpsc::Sender<SentenceJob>,
    pub interrupt: Arc<AtomicBool>,
    pub assistant_speaking: Arc<AtomicBool>,
    pub snapshot_tx: watch::Sender<StateSnapshot>,
    pub cancel: CancellationToken,
    pub turn_cancel: CancellationToken,
    pub asr: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    /// A phase entry asked for an AI greeting while a turn was still in
    /// flight; the greeting runs once that turn completes.
    pub pending_greeting: bool,
}

impl Dispatcher {
    /// Run the loop until shutdown or queue closure.
    pub async fn run(mut self) {
        if self.state.active_profile.initial_speaker == Speaker::Ai {
            self.spawn_greeting();
        }

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // The interrupt flag stays raised until the synthesizer has
            // confirmed the cancellation; clear it here so follow-up
            // speech (the concession) is not swallowed.
            if matches!(event, Event::TtsCancelled) {
                self.interrupt.store(false, Ordering::Relaxed);
            }
            let shutting_down = matches!(event, Event::Shutdown);

            let actions = reduce(&self.reducer_ctx, &mut self.state, &event);
            self.assistant_speaking
                .store(self.state.ai_speaking, Ordering::Relaxed);
            self.publish_snapshot();

            for action in actions {
                self.execute(action).await;
            }
            if shutting_down {
                break;
            }
        }

        self.bus
            .emit(names::ANALYTICS_SESSION_SUMMARY, &self.analytics.summary());
        info!("dispatcher stopped");
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Log { level, message } => match level {
                LogLevel::Debug => debug!(target: "conversation", "{message}"),
                LogLevel::Info => info!(target: "conversation", "{message}"),
                LogLevel::Warn => warn!(target: "conversation", "{message}"),
                LogLevel::Error => error!(target: "conversation", "{message}"),
            },
            Action::EmitSignal { name, payload } => {
                self.bus.emit(&name, &payload);
                if name.starts_with(names::CUSTOM_PREFIX)
                    && let Some(to) = self.triggered_transition()
                {
                    Box::pin(self.execute(Action::EnterPhase { phase_id: to })).await;
                }
            }
            Action::InterruptAi => {
                self.interrupt.store(true, Ordering::Relaxed);
                self.turn_cancel.cancel();
            }
            Action::PlayAck { text } => {
                let job = SentenceJob::Speak {
                    text,
                    voice: self.state.active_profile.voice.clone(),
                    interjection: true,
                };
                if self.sentences_tx.try_send(job).is_err() {
                    warn!("sentence queue full, dropping interjection");
                }
            }
            Action::ProcessTurn { audio, ack_prefix } => {
                let runner = self.make_runner();
                tokio::spawn(async move {
                    runner.process_turn(audio, ack_prefix).await;
                });
            }
            Action::GenerateAiGreeting => self.spawn_greeting(),
            Action::LogTurn { metrics } => {
                if let Some(controller) = self.phase_controller.as_mut() {
                    controller.turn_completed();
                }
                if self.pending_greeting {
                    self.pending_greeting = false;
                    self.spawn_greeting();
                }
                let record = self.analytics.record(&metrics);
                info!(
                    target: "analytics",
                    turn_id = record.turn_id,
                    end_reason = %record.end_reason,
                    duration_ms = record.duration_ms,
                    "turn logged"
                );
                match serde_json::to_value(&record) {
                    Ok(value) => self.bus.emit(names::ANALYTICS_TURN_LOGGED, &value),
                    Err(e) => warn!("turn record serialization failed: {e}"),
                }
            }
            Action::EnterPhase { phase_id } => self.enter_phase(&phase_id),
        }
    }

    /// Consult the phase controller; emits the triggered signal and
    /// returns the destination when an edge fires.
    fn triggered_transition(&self) -> Option<String> {
        let controller = self.phase_controller.as_ref()?;
        let transition = controller.evaluate(&self.state.emitted_signals)?;
        let to = transition.to.clone();
        self.bus.emit(
            names::PHASE_TRANSITION_TRIGGERED,
            &json!({
                "from": transition.from,
                "to": transition.to,
                "trigger": transition.trigger_signals,
            }),
        );
        Some(to)
    }

    /// Atomically rewrite state for a phase entry.
    fn enter_phase(&mut self, to: &str) {
        let Some(plan) = self.state.phase_profile.clone() else {
            warn!("phase transition requested without a mounted plan");
            return;
        };
        let Some(spec) = plan.phase(to) else {
            warn!("phase transition to unknown phase '{to}'");
            return;
        };

        self.bus
            .emit(names::PHASE_TRANSITION_STARTED, &json!({"phase_id": to}));
        if let Some(controller) = self.phase_controller.as_mut() {
            controller.mark_transitioned(to);
        }

        self.state.active_profile = Arc::new(spec.profile.clone());
        self.state.current_phase_id = Some(to.to_owned());
        self.state.emitted_signals.clear();
        self.state.ack_fired_this_turn = false;
        self.state.pending_ack = None;
        self.state.pending_concession = None;
        self.state.partial_since_ai_speech = false;
        self.state.phases_completed += 1;
        if let Ok(mut memory) = self.memory.lock() {
            memory.clear();
        }

        let progress = progress_pct(self.state.phases_completed, plan.total_phases());
        self.bus.emit(
            names::PHASE_PROGRESS_UPDATED,
            &json!({
                "phase_id": to,
                "progress_pct": progress,
                "phases_completed": self.state.phases_completed,
                "total_phases": plan.total_phases(),
            }),
        );
        self.publish_snapshot();

        if spec.profile.initial_speaker == Speaker::Ai {
            if self.state.turn_active {
                self.pending_greeting = true;
            } else {
                self.spawn_greeting();
            }
        }

        self.bus.emit(
            names::PHASE_TRANSITION_COMPLETE,
            &json!({
                "phase_id": to,
                "instruction_name": spec.profile.name,
            }),
        );
        info!(phase = to, "phase transition complete");
    }

    fn spawn_greeting(&mut self) {
        let runner = self.make_runner();
        tokio::spawn(async move {
            runner.greeting().await;
        });
    }

    /// Snapshot the mounted persona and wire a fresh worker for one turn.
    fn make_runner(&mut self) -> TurnRunner {
        self.turn_cancel = self.cancel.child_token();
        TurnRunner {
            profile: Arc::clone(&self.state.active_profile),
            plan: self.state.phase_profile.as_ref().and_then(|plan| {
                self.state
                    .current_phase_id
                    .clone()
                    .map(|id| (Arc::clone(plan), id))
            }),
            memory: Arc::clone(&self.memory),
            asr: Arc::clone(&self.asr),
            llm: Arc::clone(&self.llm),
            events: self.events_tx.clone(),
            sentences: self.sentences_tx.clone(),
            interrupt: Arc::clone(&self.interrupt),
            assistant_speaking: Arc::clone(&self.assistant_speaking),
            cancel: self.turn_cancel.clone(),
            retry: self.config.retry.clone(),
            sample_rate: self.config.audio.input_sample_rate,
        }
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.state.snapshot());
    }
}
