//! Session rules and the monitoring window they apply to.

use chrono::{DateTime, Local};
use warden_protocol::AgentConfig;

const GOAL_FALLBACK: &str = "your goal";

/// The user's declared rules for one session. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    text: String,
}

impl RuleSet {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.rules.trim())
    }

    /// Builds the canonical rules text from its two halves.
    pub fn compose(goal: &str, prohibited: &str) -> Self {
        Self::new(format!(
            "Goal: {}\nProhibited: {}",
            goal.trim(),
            prohibited.trim()
        ))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// First non-empty line, used in the level-1 reminder.
    pub fn goal_summary(&self) -> &str {
        self.text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(GOAL_FALLBACK)
    }
}

/// Half-open range `[start, end)` during which the agent may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringWindow {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl MonitoringWindow {
    pub fn new(start: DateTime<Local>, end: DateTime<Local>) -> Self {
        Self { start, end }
    }

    /// A config without both timestamps has no window.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        match (config.start_time, config.end_time) {
            (Some(start), Some(end)) => Some(Self::new(start, end)),
            _ => None,
        }
    }

    pub fn contains(&self, now: DateTime<Local>) -> bool {
        now >= self.start && now < self.end
    }

    pub fn has_ended(&self, now: DateTime<Local>) -> bool {
        now >= self.end
    }

    pub fn remaining(&self, now: DateTime<Local>) -> chrono::Duration {
        if self.has_ended(now) {
            chrono::Duration::zero()
        } else {
            self.end - now
        }
    }
}
