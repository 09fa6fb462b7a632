//! Colloquy: real-time duplex voice conversation engine.
//!
//! Mediates between a human speaker and a language-model-backed persona:
//! microphone audio is segmented into turns by voice activity,
//! transcribed, sent to a generator, synthesized back to speech, and
//! played while the microphone keeps listening for interruption.
//!
//! # Architecture
//!
//! Everything funnels through a single event loop:
//! - **Producers** (audio capture + VAD, partial transcription,
//!   generation/synthesis workers, a periodic tick) enqueue [`engine::events::Event`]s
//!   onto one FIFO queue and never touch state.
//! - A pure **reducer** folds each event into the conversation state and
//!   emits actions.
//! - The **dispatcher** executes those actions: spawning turn processors,
//!   starting and cancelling synthesis, emitting observation signals.
//!
//! Personas are immutable [`profile::Profile`]s; staged conversations are
//! [`profile::PhaseProfile`]s whose transitions fire on structured
//! signals the generator embeds in its replies inside
//! `<signals>...</signals>` blocks.

pub mod analytics;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod profile;
pub mod providers;
pub mod signals;

pub use config::EngineConfig;
pub use engine::events::{Action, Event};
pub use engine::state::{ConversationPhase, StateSnapshot};
pub use engine::{Collaborators, ConversationEngine, EngineHandle, PersonaMount};
pub use error::{EngineError, Result};
pub use profile::{Authority, PhaseProfile, Profile, Speaker};
pub use signals::SignalBus;
