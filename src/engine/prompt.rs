//! Deterministic system prompt composition.
//!
//! The base section is profile-independent so any profile can be mounted
//! at any time; everything persona-specific is appended after it in a
//! fixed order: custom signal inventory, phase context, instructions.

use crate::profile::{PhaseProfile, Profile};
use std::fmt::Write;

/// Generic signal-emission instructions shared by every profile.
const PROMPT_BASE: &str = "\
You are one side of a spoken conversation. Keep replies short, natural, \
and speakable; avoid lists and markup. When you have structured \
observations to report, append them at the very end of your reply as a \
single JSON object wrapped in <signals>...</signals> tags, for example: \
<signals>{\"topic.resolved\": {\"confidence\": 0.9}}</signals>. Strict JSON \
only inside the tags. Never read the tags or their contents aloud; \
everything before the first tag is spoken to the listener.";

/// Assemble the system prompt for one generation.
pub fn compose_system_prompt(profile: &Profile, plan: Option<(&PhaseProfile, &str)>) -> String {
    let mut prompt = String::from(PROMPT_BASE);

    if !profile.custom_signals.is_empty() {
        prompt.push_str("\n\nSignals you may emit:\n");
        for (name, description) in &profile.custom_signals {
            let _ = writeln!(prompt, "- {name}: {description}");
        }
    }

    if let Some((plan, phase_id)) = plan {
        prompt.push_str("\n=== PHASE CONTEXT ===\n");
        if !plan.global_context.trim().is_empty() {
            prompt.push_str(plan.global_context.trim());
            prompt.push('\n');
        }
        if let Some(spec) = plan.phase(phase_id)
            && !spec.context.trim().is_empty()
        {
            prompt.push_str(spec.context.trim());
            prompt.push('\n');
        }
    }

    if !profile.instructions.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(profile.instructions.trim());
    }

    prompt
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::profile::{PhaseSpec, PhaseTransition};

    #[test]
    fn base_section_is_profile_independent() {
        let a = compose_system_prompt(&Profile::default(), None);
        let b = compose_system_prompt(
            &Profile {
                name: "other".to_owned(),
                instructions: "Be terse.".to_owned(),
                ..Profile::default()
            },
            None,
        );
        assert!(a.starts_with(PROMPT_BASE));
        assert!(b.starts_with(PROMPT_BASE));
    }

    #[test]
    fn custom_signals_are_listed() {
        let mut profile = Profile::default();
        profile.custom_signals.insert(
            "intake.done".to_owned(),
            "all intake questions answered".to_owned(),
        );
        let prompt = compose_system_prompt(&profile, None);
        assert!(prompt.contains("- intake.done: all intake questions answered"));
    }

    #[test]
    fn phase_context_block_includes_global_and_phase_text() {
        let plan = PhaseProfile {
            name: "interview".to_owned(),
            initial_phase: "intake".to_owned(),
            global_context: "Stay on schedule.".to_owned(),
            phases: vec![PhaseSpec {
                id: "intake".to_owned(),
                profile: Profile::default(),
                context: "Collect the basics.".to_owned(),
            }],
            transitions: Vec::<PhaseTransition>::new(),
        };
        let prompt = compose_system_prompt(&Profile::default(), Some((&plan, "intake")));
        assert!(prompt.contains("=== PHASE CONTEXT ==="));
        assert!(prompt.contains("Stay on schedule."));
        assert!(prompt.contains("Collect the basics."));
    }

    #[test]
    fn instructions_come_last() {
        let profile = Profile {
            instructions: "Speak like a radio host.".to_owned(),
            ..Profile::default()
        };
        let prompt = compose_system_prompt(&profile, None);
        assert!(prompt.ends_with("Speak like a radio host."));
    }
}
