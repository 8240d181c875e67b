//! # warden-core
//!
//! Core library for warden, an accountability agent that watches the screen
//! during a declared session, asks an AI judge whether the user keeps to
//! their rules, and escalates through increasingly disruptive interventions
//! while they do not.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Long calls run on plain threads with
//!   explicit deadlines.
//! - **Fail open**: An unreachable judge never counts as a violation.
//! - **Files as the contract**: Processes share state only through the
//!   coordination files in the monitoring directory, so any of them can crash
//!   and restart independently.
//! - **Capabilities at the edge**: Desktop effects and OS supervision sit
//!   behind traits; the state machines never touch the platform directly.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warden_core::{AnalysisPipeline, CoordinationStore, EscalationEngine, Paths, ScoreInput};
//!
//! let store = CoordinationStore::new(Paths::resolve()?);
//! let config = store.load_config()?;
//! let verdict = pipeline.analyze(&batch, &rules);
//! let transition = engine.apply(ScoreInput::Verdict(verdict.is_violation));
//! store.write_status(transition.score, transition.level)?;
//! ```

pub mod analysis;
pub mod backoff;
pub mod capture;
pub mod config;
pub mod effectors;
pub mod error;
pub mod escalation;
pub mod exec;
pub mod logging;
pub mod rules;
pub mod signal;
pub mod store;
pub mod supervision;
pub mod tuning;

// Re-export commonly used items at crate root
pub use analysis::{AnalysisPipeline, Prompt, Strategy, Verdict, VerdictSource};
pub use backoff::{apply_startup_backoff, BackoffPolicy};
pub use capture::{CaptureBatch, CaptureSource, CommandCapture};
pub use config::{monitoring_dir, Paths};
pub use effectors::{Capability, EffectorSet, Notifier};
pub use error::{Result, WardenError};
pub use escalation::{
    Effect, EscalationEngine, InterventionSet, ScoreInput, ScoringPolicy, Transition,
};
pub use rules::{MonitoringWindow, RuleSet};
pub use signal::StopSignal;
pub use store::{CoordinationStore, FileLease};
pub use tuning::{load_tuning_or_default, Tuning};
