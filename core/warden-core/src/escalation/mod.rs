//! Score and penalty level, and the interventions each level requires.
//!
//! The engine is a plain state machine driven by [`ScoreInput`]s. Callers
//! serialise access (the agent keeps it behind one mutex) so a command delta
//! and a tick verdict can never interleave.
//!
//! Transitions:
//! - level rises: switch on persistent effects not yet active, fire one-shot
//!   effects crossed on the way up, notify once, and report a terminal tier
//!   if one was crossed. Terminal actions run later, off the engine lock.
//! - level falls to 0, or the score falls to 0: switch everything off.
//! - otherwise: score only, no effector calls.

pub mod countdown;
mod policy;

pub use policy::{level_message, level_notification, Effect, InterventionSet, ScoringPolicy};

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::effectors::{EffectorSet, Notifier};

const NOTICE_TITLE: &str = "Warden";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreInput {
    /// A judge verdict; `true` is a violation.
    Verdict(bool),
    /// A manual adjustment from the command channel.
    Delta(i64),
}

/// What one input did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transition {
    pub previous_score: u32,
    pub score: u32,
    pub previous_level: u8,
    pub level: u8,
    /// Effects switched on or fired by this input.
    pub fired: Vec<Effect>,
    /// Effects whose capability failed, with the error text.
    pub failures: Vec<(Effect, String)>,
    pub notice: Option<String>,
    pub reset: bool,
    pub terminal: Option<Effect>,
}

impl Transition {
    pub fn level_changed(&self) -> bool {
        self.level != self.previous_level
    }

    pub fn escalated(&self) -> bool {
        self.level > self.previous_level
    }
}

pub struct EscalationEngine {
    policy: ScoringPolicy,
    effectors: EffectorSet,
    notifier: Arc<dyn Notifier>,
    goal_summary: String,
    score: u32,
    level: u8,
    active: BTreeSet<Effect>,
}

impl EscalationEngine {
    pub fn new(
        policy: ScoringPolicy,
        effectors: EffectorSet,
        notifier: Arc<dyn Notifier>,
        goal_summary: impl Into<String>,
    ) -> Self {
        Self {
            policy,
            effectors,
            notifier,
            goal_summary: goal_summary.into(),
            score: 0,
            level: 0,
            active: BTreeSet::new(),
        }
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Persistent effects currently switched on.
    pub fn active(&self) -> &BTreeSet<Effect> {
        &self.active
    }

    pub fn effectors(&self) -> &EffectorSet {
        &self.effectors
    }

    pub fn apply(&mut self, input: ScoreInput) -> Transition {
        let previous_score = self.score;
        let previous_level = self.level;
        self.score = match input {
            ScoreInput::Verdict(is_violation) => self.policy.after_verdict(self.score, is_violation),
            ScoreInput::Delta(delta) => self.policy.after_delta(self.score, delta),
        };
        self.level = self.policy.level_for(self.score);

        let mut transition = Transition {
            previous_score,
            score: self.score,
            previous_level,
            level: self.level,
            ..Transition::default()
        };

        if self.level > previous_level {
            self.escalate(previous_level, &mut transition);
        } else if self.level == 0 && (previous_level > 0 || (previous_score > 0 && self.score == 0))
        {
            self.reset_all(&mut transition);
        }
        transition
    }

    /// Restores state after an agent restart. Persistent effects for the
    /// level come back on; notices and one-shots do not. A score at the
    /// shutdown tier reports it as terminal again so a restart cannot escape it.
    pub fn resume(&mut self, score: u32) -> Transition {
        self.score = score;
        self.level = self.policy.level_for(score);
        let mut transition = Transition {
            previous_score: score,
            score,
            previous_level: self.level,
            level: self.level,
            ..Transition::default()
        };
        let set = InterventionSet::for_level(self.level);
        for effect in set.persistent() {
            self.switch_on(effect, &mut transition);
        }
        if set.contains(Effect::ForceShutdown) {
            transition.terminal = Some(Effect::ForceShutdown);
        }
        transition
    }

    /// Switches every effect off. Used when the session ends.
    pub fn shutdown(&mut self) -> Transition {
        let mut transition = Transition {
            previous_score: self.score,
            score: self.score,
            previous_level: self.level,
            level: self.level,
            ..Transition::default()
        };
        self.reset_all(&mut transition);
        transition
    }

    fn escalate(&mut self, previous_level: u8, transition: &mut Transition) {
        let target = InterventionSet::for_level(self.level);
        for effect in target.iter() {
            if effect.is_persistent() {
                self.switch_on(effect, transition);
            } else if !effect.is_terminal() && effect.tier() > previous_level {
                match self.effectors.activate(effect) {
                    Ok(()) => transition.fired.push(effect),
                    Err(err) => transition.failures.push((effect, err.to_string())),
                }
            }
        }

        transition.terminal = if previous_level < 7 && self.level >= 7 {
            Some(Effect::ForceShutdown)
        } else if previous_level < 6 && self.level >= 6 {
            Some(Effect::ForceLock)
        } else {
            None
        };

        let notice = level_notification(self.level, &self.goal_summary);
        if let Err(err) = self.notifier.notify(NOTICE_TITLE, &notice) {
            warn!(error = %err, "Failed to show notification");
        }
        info!(level = self.level, score = self.score, "Penalty level raised");
        transition.notice = Some(notice);

        for (effect, details) in &transition.failures {
            warn!(%effect, error = %details, "Intervention failed");
        }
    }

    fn switch_on(&mut self, effect: Effect, transition: &mut Transition) {
        if self.active.contains(&effect) {
            return;
        }
        match self.effectors.activate(effect) {
            Ok(()) => {
                self.active.insert(effect);
                transition.fired.push(effect);
            }
            Err(err) => transition.failures.push((effect, err.to_string())),
        }
    }

    fn reset_all(&mut self, transition: &mut Transition) {
        for effect in Effect::ALL.into_iter().filter(|effect| effect.is_persistent()) {
            if !self.effectors.supports(effect) {
                continue;
            }
            if let Err(err) = self.effectors.deactivate(effect) {
                warn!(%effect, error = %err, "Failed to switch off intervention");
                transition.failures.push((effect, err.to_string()));
            }
        }
        self.active.clear();
        transition.reset = true;
    }
}
