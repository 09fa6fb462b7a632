//! Persona descriptors: profiles and multi-stage phase profiles.
//!
//! A [`Profile`] is an immutable persona: prompts, voice, generation
//! parameters, turn timing, and interruption authority. A [`PhaseProfile`]
//! strings several profiles together into a staged conversation whose
//! transitions are driven by signals the generator emits in its replies.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who may interrupt whom during AI speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    /// The human always wins; AI speech yields immediately.
    Human,
    /// The AI cannot be interrupted.
    Ai,
    /// Mediated: interruption requires transcript or energy evidence,
    /// scaled by the profile's sensitivity.
    #[default]
    Default,
}

/// Which party opens the conversation (or a phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[default]
    Human,
    Ai,
}

impl Speaker {
    /// Stable string form used in signal payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
        }
    }
}

/// Turn-taking timing parameters, all in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTiming {
    /// Silence before a speaking human is considered to be pausing.
    pub pause_ms: u64,
    /// Silence before a pausing human's turn is considered finished.
    pub end_ms: u64,
    /// Hard cap on a single human turn. Disabled under human authority.
    pub safety_timeout_ms: u64,
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self {
            pause_ms: 600,
            end_ms: 1_200,
            safety_timeout_ms: 2_500,
        }
    }
}

/// An immutable persona descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Display name.
    pub name: String,
    /// Which party speaks first when this profile is mounted.
    pub initial_speaker: Speaker,
    /// Voice id handed to the TTS collaborator.
    pub voice: String,
    /// Generation token budget.
    pub max_tokens: u32,
    /// Generation temperature.
    pub temperature: f32,
    /// Turn-taking timing.
    pub timing: TurnTiming,
    /// Interruption sensitivity in \[0, 1\]: 0 = transcript evidence only,
    /// 1 = an energy spike suffices. Only meaningful under
    /// [`Authority::Default`].
    pub interruption_sensitivity: f32,
    /// Interruption authority.
    pub authority: Authority,
    /// Optional cap on how long the human may speak before a spoken
    /// acknowledgment, in seconds. Ignored under human authority.
    pub speaking_limit_sec: Option<u64>,
    /// Short utterances spoken when the speaking limit is exceeded.
    pub acknowledgments: Vec<String>,
    /// Persona instructions appended to the composed system prompt.
    pub instructions: String,
    /// Custom signal names the generator is invited to emit, with a
    /// one-line description each.
    pub custom_signals: BTreeMap<String, String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "assistant".to_owned(),
            initial_speaker: Speaker::Human,
            voice: "default".to_owned(),
            max_tokens: 512,
            temperature: 0.7,
            timing: TurnTiming::default(),
            interruption_sensitivity: 0.5,
            authority: Authority::Default,
            speaking_limit_sec: None,
            acknowledgments: vec!["Mm-hmm.".to_owned()],
            instructions: String::new(),
            custom_signals: BTreeMap::new(),
        }
    }
}

impl Profile {
    /// Validate the descriptor before mounting it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.acknowledgments.is_empty() {
            return Err(EngineError::Config(format!(
                "profile '{}': acknowledgments must not be empty",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.interruption_sensitivity) {
            return Err(EngineError::Config(format!(
                "profile '{}': interruption_sensitivity {} outside [0, 1]",
                self.name, self.interruption_sensitivity
            )));
        }
        if self.timing.pause_ms == 0 || self.timing.end_ms < self.timing.pause_ms {
            return Err(EngineError::Config(format!(
                "profile '{}': timing requires 0 < pause_ms <= end_ms",
                self.name
            )));
        }
        if self.timing.safety_timeout_ms == 0 {
            return Err(EngineError::Config(format!(
                "profile '{}': safety_timeout_ms must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// One stage of a [`PhaseProfile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Stable id referenced by transitions.
    pub id: String,
    /// The persona active while this phase runs.
    pub profile: Profile,
    /// Context prepended to the system prompt while this phase is active.
    #[serde(default)]
    pub context: String,
}

/// A transition edge between two phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Source phase id.
    pub from: String,
    /// Destination phase id.
    pub to: String,
    /// Custom signal names (already `custom.`-prefixed) that drive the edge.
    pub trigger_signals: Vec<String>,
    /// When true, every trigger signal must have been emitted; otherwise
    /// any one suffices.
    #[serde(default)]
    pub require_all: bool,
}

/// An ordered, staged conversation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProfile {
    /// Display name.
    pub name: String,
    /// Id of the phase mounted at engine start.
    pub initial_phase: String,
    /// Context shared by every phase.
    #[serde(default)]
    pub global_context: String,
    /// Declaration order is meaningful: when several transitions are
    /// eligible in the same turn, the first declared wins.
    pub phases: Vec<PhaseSpec>,
    /// Transition edges.
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
}

impl PhaseProfile {
    /// Look up a phase by id.
    pub fn phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Number of phases in the plan.
    pub fn total_phases(&self) -> usize {
        self.phases.len()
    }

    /// Validate the plan: the initial phase and every transition endpoint
    /// must resolve, and every member profile must itself be valid.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the plan is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(EngineError::Config(format!(
                "phase profile '{}': no phases declared",
                self.name
            )));
        }
        if self.phase(&self.initial_phase).is_none() {
            return Err(EngineError::Config(format!(
                "phase profile '{}': initial phase '{}' not found",
                self.name, self.initial_phase
            )));
        }
        for phase in &self.phases {
            phase.profile.validate()?;
        }
        for transition in &self.transitions {
            for endpoint in [&transition.from, &transition.to] {
                if self.phase(endpoint).is_none() {
                    return Err(EngineError::Config(format!(
                        "phase profile '{}': transition references unknown phase '{}'",
                        self.name, endpoint
                    )));
                }
            }
            if transition.trigger_signals.is_empty() {
                return Err(EngineError::Config(format!(
                    "phase profile '{}': transition {} -> {} has no trigger signals",
                    self.name, transition.from, transition.to
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn phase(id: &str) -> PhaseSpec {
        PhaseSpec {
            id: id.to_owned(),
            profile: Profile::default(),
            context: String::new(),
        }
    }

    #[test]
    fn default_profile_is_valid() {
        Profile::default().validate().unwrap();
    }

    #[test]
    fn empty_acknowledgments_rejected() {
        let profile = Profile {
            acknowledgments: Vec::new(),
            ..Profile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn sensitivity_out_of_range_rejected() {
        let profile = Profile {
            interruption_sensitivity: 1.5,
            ..Profile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn end_shorter_than_pause_rejected() {
        let profile = Profile {
            timing: TurnTiming {
                pause_ms: 800,
                end_ms: 400,
                safety_timeout_ms: 2_500,
            },
            ..Profile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn phase_profile_checks_transition_endpoints() {
        let plan = PhaseProfile {
            name: "interview".to_owned(),
            initial_phase: "intake".to_owned(),
            global_context: String::new(),
            phases: vec![phase("intake")],
            transitions: vec![PhaseTransition {
                from: "intake".to_owned(),
                to: "missing".to_owned(),
                trigger_signals: vec!["custom.intake.done".to_owned()],
                require_all: false,
            }],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn phase_profile_round_trips_through_json() {
        let plan = PhaseProfile {
            name: "interview".to_owned(),
            initial_phase: "intake".to_owned(),
            global_context: "Be brief.".to_owned(),
            phases: vec![phase("intake"), phase("assessment")],
            transitions: vec![PhaseTransition {
                from: "intake".to_owned(),
                to: "assessment".to_owned(),
                trigger_signals: vec!["custom.intake.done".to_owned()],
                require_all: false,
            }],
        };
        plan.validate().unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: PhaseProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phases.len(), 2);
        assert_eq!(back.transitions[0].to, "assessment");
    }
}
