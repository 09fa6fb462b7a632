//! Phase controller: signal-driven transitions through a staged plan.
//!
//! The controller watches the custom signals the generator has emitted in
//! the current stage and decides when an edge fires. It never mutates the
//! conversation state itself; the dispatcher applies the rewrite and
//! publishes the transition signals in order.

use crate::profile::{PhaseProfile, PhaseTransition};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Tracks the active stage of a mounted [`PhaseProfile`].
pub struct PhaseController {
    plan: Arc<PhaseProfile>,
    current: String,
    transitioned_this_turn: bool,
}

impl PhaseController {
    pub fn new(plan: Arc<PhaseProfile>) -> Self {
        let current = plan.initial_phase.clone();
        Self {
            plan,
            current,
            transitioned_this_turn: false,
        }
    }

    /// Id of the active stage.
    pub fn current_phase(&self) -> &str {
        &self.current
    }

    /// The mounted plan.
    pub fn plan(&self) -> &Arc<PhaseProfile> {
        &self.plan
    }

    /// Find the transition that should fire given the signals emitted so
    /// far, if any. At most one transition fires per turn; when several
    /// are eligible the first declared wins.
    pub fn evaluate(&self, emitted: &BTreeSet<String>) -> Option<&PhaseTransition> {
        if self.transitioned_this_turn {
            return None;
        }
        self.plan
            .transitions
            .iter()
            .find(|t| t.from == self.current && satisfied(t, emitted))
    }

    /// Record that a transition to `to` has been applied.
    pub fn mark_transitioned(&mut self, to: &str) {
        self.current = to.to_owned();
        self.transitioned_this_turn = true;
    }

    /// Re-arm the controller once the turn that fired a transition ends.
    pub fn turn_completed(&mut self) {
        self.transitioned_this_turn = false;
    }
}

fn satisfied(transition: &PhaseTransition, emitted: &BTreeSet<String>) -> bool {
    if transition.require_all {
        transition
            .trigger_signals
            .iter()
            .all(|s| emitted.contains(s))
    } else {
        transition
            .trigger_signals
            .iter()
            .any(|s| emitted.contains(s))
    }
}

/// Percentage of the plan completed after `phases_completed` transitions.
pub fn progress_pct(phases_completed: u32, total_phases: usize) -> u64 {
    let steps = total_phases.saturating_sub(1).max(1) as u64;
    (u64::from(phases_completed) * 100 / steps).min(100)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::profile::{PhaseSpec, Profile};

    fn plan() -> Arc<PhaseProfile> {
        let phase = |id: &str| PhaseSpec {
            id: id.to_owned(),
            profile: Profile::default(),
            context: String::new(),
        };
        Arc::new(PhaseProfile {
            name: "interview".to_owned(),
            initial_phase: "intake".to_owned(),
            global_context: String::new(),
            phases: vec![phase("intake"), phase("assessment"), phase("wrapup")],
            transitions: vec![
                PhaseTransition {
                    from: "intake".to_owned(),
                    to: "assessment".to_owned(),
                    trigger_signals: vec!["custom.intake.done".to_owned()],
                    require_all: false,
                },
                PhaseTransition {
                    from: "intake".to_owned(),
                    to: "wrapup".to_owned(),
                    trigger_signals: vec!["custom.abort".to_owned()],
                    require_all: false,
                },
                PhaseTransition {
                    from: "assessment".to_owned(),
                    to: "wrapup".to_owned(),
                    trigger_signals: vec![
                        "custom.scored".to_owned(),
                        "custom.reviewed".to_owned(),
                    ],
                    require_all: true,
                },
            ],
        })
    }

    fn emitted(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn any_trigger_fires_an_edge() {
        let controller = PhaseController::new(plan());
        let hit = controller.evaluate(&emitted(&["custom.intake.done"])).unwrap();
        assert_eq!(hit.to, "assessment");
    }

    #[test]
    fn require_all_needs_every_trigger() {
        let mut controller = PhaseController::new(plan());
        controller.mark_transitioned("assessment");
        controller.turn_completed();

        assert!(controller.evaluate(&emitted(&["custom.scored"])).is_none());
        let hit = controller
            .evaluate(&emitted(&["custom.scored", "custom.reviewed"]))
            .unwrap();
        assert_eq!(hit.to, "wrapup");
    }

    #[test]
    fn first_declared_transition_wins() {
        let controller = PhaseController::new(plan());
        let both = emitted(&["custom.intake.done", "custom.abort"]);
        let hit = controller.evaluate(&both).unwrap();
        assert_eq!(hit.to, "assessment");
    }

    #[test]
    fn at_most_one_transition_per_turn() {
        let mut controller = PhaseController::new(plan());
        let hit = controller.evaluate(&emitted(&["custom.intake.done"])).unwrap();
        let to = hit.to.clone();
        controller.mark_transitioned(&to);

        // Even with eligible triggers for the next edge, nothing fires
        // until the turn completes.
        let loaded = emitted(&["custom.scored", "custom.reviewed"]);
        assert!(controller.evaluate(&loaded).is_none());

        controller.turn_completed();
        assert!(controller.evaluate(&loaded).is_some());
    }

    #[test]
    fn signals_for_other_phases_do_not_fire() {
        let controller = PhaseController::new(plan());
        assert!(controller.evaluate(&emitted(&["custom.scored"])).is_none());
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let mut last = 0;
        for completed in 0..6 {
            let pct = progress_pct(completed, 3);
            assert!(pct >= last);
            assert!(pct <= 100);
            last = pct;
        }
        assert_eq!(progress_pct(1, 3), 50);
        assert_eq!(progress_pct(2, 3), 100);
        assert_eq!(progress_pct(5, 3), 100);
    }
}
