use std::collections::BTreeSet;
use std::fmt;

use crate::tuning::ScoringTuning;

/// Something the agent does to the user's desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Effect {
    InputDelay,
    Desaturate,
    PointerInversion,
    AudioAlert,
    ForceLock,
    ForceShutdown,
}

impl Effect {
    pub const ALL: [Effect; 6] = [
        Effect::InputDelay,
        Effect::Desaturate,
        Effect::PointerInversion,
        Effect::AudioAlert,
        Effect::ForceLock,
        Effect::ForceShutdown,
    ];

    /// Lowest penalty level that requires this effect.
    pub fn tier(self) -> u8 {
        match self {
            Effect::InputDelay => 2,
            Effect::Desaturate => 3,
            Effect::PointerInversion => 4,
            Effect::AudioAlert => 5,
            Effect::ForceLock => 6,
            Effect::ForceShutdown => 7,
        }
    }

    /// Stays on until reset, as opposed to firing once per crossing.
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            Effect::InputDelay | Effect::Desaturate | Effect::PointerInversion
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Effect::ForceLock | Effect::ForceShutdown)
    }

    /// Key used for `[effectors.<key>]` overrides.
    pub fn key(self) -> &'static str {
        match self {
            Effect::InputDelay => "input_delay",
            Effect::Desaturate => "desaturate",
            Effect::PointerInversion => "pointer_inversion",
            Effect::AudioAlert => "audio_alert",
            Effect::ForceLock => "force_lock",
            Effect::ForceShutdown => "force_shutdown",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Effects required at one level. Built from tiers, so level `n` always
/// contains everything level `n - 1` does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterventionSet(BTreeSet<Effect>);

impl InterventionSet {
    pub fn for_level(level: u8) -> Self {
        Self(
            Effect::ALL
                .into_iter()
                .filter(|effect| effect.tier() <= level)
                .collect(),
        )
    }

    pub fn contains(&self, effect: Effect) -> bool {
        self.0.contains(&effect)
    }

    pub fn persistent(&self) -> impl Iterator<Item = Effect> + '_ {
        self.0.iter().copied().filter(|effect| effect.is_persistent())
    }

    pub fn iter(&self) -> impl Iterator<Item = Effect> + '_ {
        self.0.iter().copied()
    }

    pub fn is_superset(&self, other: &InterventionSet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Score deltas and the score to level mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringPolicy {
    pub violation_points: u32,
    pub compliance_points: u32,
    pub level_width: u32,
    pub max_level: u8,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::from_tuning(&ScoringTuning::default())
    }
}

impl ScoringPolicy {
    pub fn from_tuning(tuning: &ScoringTuning) -> Self {
        Self {
            violation_points: tuning.violation_points,
            compliance_points: tuning.compliance_points,
            level_width: tuning.level_width.max(1),
            max_level: tuning.max_level.clamp(1, 7),
        }
    }

    pub fn level_for(&self, score: u32) -> u8 {
        let level = score / self.level_width;
        level.min(u32::from(self.max_level)) as u8
    }

    pub fn after_verdict(&self, score: u32, is_violation: bool) -> u32 {
        if is_violation {
            score.saturating_add(self.violation_points)
        } else {
            score.saturating_sub(self.compliance_points)
        }
    }

    pub fn after_delta(&self, score: u32, delta: i64) -> u32 {
        let next = i64::from(score).saturating_add(delta);
        next.clamp(0, i64::from(u32::MAX)) as u32
    }
}

/// Audit line for entering `level`.
pub fn level_message(level: u8) -> &'static str {
    match level {
        0 => "Level 0: all interventions cleared",
        1 => "Level 1: warning",
        2 => "Level 2: input delay started",
        3 => "Level 3: grayscale applied",
        4 => "Level 4: pointer inversion started",
        5 => "Level 5: audio alert",
        6 => "Level 6: forced screen lock",
        _ => "Level 7: forced shutdown",
    }
}

/// Desktop notification for entering `level`.
pub fn level_notification(level: u8, goal_summary: &str) -> String {
    match level {
        1 => format!(
            "Your goal is \"{}\". Get back to what you planned to do.",
            goal_summary
        ),
        6 => "Point limit reached. The screen will lock shortly and cannot be unlocked for a few seconds.".to_string(),
        7 => "Final warning. The computer will shut down in a few seconds.".to_string(),
        _ => level_message(level).to_string(),
    }
}
