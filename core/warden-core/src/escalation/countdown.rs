//! Grace countdowns for the terminal tiers.
//!
//! The lock tier re-locks repeatedly for a short hold period so an immediate
//! unlock does not stick. The shutdown tier fires once after its grace.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::Effect;
use crate::effectors::EffectorSet;
use crate::error::{Result, WardenError};
use crate::signal::StopSignal;
use crate::tuning::TerminalTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalTiming {
    pub lock_grace: Duration,
    pub lock_hold: Duration,
    pub lock_repeat: Duration,
    pub shutdown_grace: Duration,
}

impl TerminalTiming {
    pub fn from_tuning(tuning: &TerminalTuning) -> Self {
        Self {
            lock_grace: Duration::from_secs(tuning.lock_grace_secs),
            lock_hold: Duration::from_secs(tuning.lock_hold_secs),
            lock_repeat: Duration::from_millis(tuning.lock_repeat_ms.max(50)),
            shutdown_grace: Duration::from_secs(tuning.shutdown_grace_secs),
        }
    }
}

impl Default for TerminalTiming {
    fn default() -> Self {
        Self::from_tuning(&TerminalTuning::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// The terminal action ran (or was attempted).
    Completed(Effect),
    /// The session ended first.
    Cancelled(Effect),
}

/// Runs the countdown for `effect` on the calling thread.
pub fn run(
    effect: Effect,
    timing: &TerminalTiming,
    effectors: &EffectorSet,
    stop: &StopSignal,
) -> CountdownOutcome {
    match effect {
        Effect::ForceLock => {
            if stop.wait(timing.lock_grace) {
                return CountdownOutcome::Cancelled(effect);
            }
            info!("Forcing screen lock");
            let started = Instant::now();
            loop {
                if let Err(err) = effectors.activate(Effect::ForceLock) {
                    warn!(error = %err, "Screen lock failed");
                }
                if started.elapsed() >= timing.lock_hold {
                    break;
                }
                if stop.wait(timing.lock_repeat) {
                    return CountdownOutcome::Cancelled(effect);
                }
            }
            CountdownOutcome::Completed(effect)
        }
        Effect::ForceShutdown => {
            if stop.wait(timing.shutdown_grace) {
                return CountdownOutcome::Cancelled(effect);
            }
            info!("Forcing shutdown");
            if let Err(err) = effectors.activate(Effect::ForceShutdown) {
                warn!(error = %err, "Shutdown failed");
            }
            CountdownOutcome::Completed(effect)
        }
        other => {
            warn!(effect = %other, "Not a terminal effect");
            CountdownOutcome::Cancelled(other)
        }
    }
}

/// Runs the countdown on its own thread and hands the outcome to `on_done`.
pub fn spawn<F>(
    effect: Effect,
    timing: TerminalTiming,
    effectors: EffectorSet,
    stop: StopSignal,
    on_done: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce(CountdownOutcome) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("countdown-{}", effect))
        .spawn(move || on_done(run(effect, &timing, &effectors, &stop)))
        .map_err(|err| WardenError::io("Failed to spawn countdown thread", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effectors::{EffectorCall, RecordingEffectors};
    use std::sync::mpsc;

    fn fast() -> TerminalTiming {
        TerminalTiming {
            lock_grace: Duration::from_millis(10),
            lock_hold: Duration::from_millis(120),
            lock_repeat: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(10),
        }
    }

    #[test]
    fn lock_repeats_during_hold() {
        let recorder = RecordingEffectors::new();
        let outcome = run(
            Effect::ForceLock,
            &fast(),
            &recorder.effector_set(),
            &StopSignal::new(),
        );
        assert_eq!(outcome, CountdownOutcome::Completed(Effect::ForceLock));
        let locks = recorder
            .calls()
            .into_iter()
            .filter(|call| *call == EffectorCall::Activate(Effect::ForceLock))
            .count();
        assert!(locks >= 2, "expected repeated locks, got {}", locks);
    }

    #[test]
    fn shutdown_fires_once() {
        let recorder = RecordingEffectors::new();
        let outcome = run(
            Effect::ForceShutdown,
            &fast(),
            &recorder.effector_set(),
            &StopSignal::new(),
        );
        assert_eq!(outcome, CountdownOutcome::Completed(Effect::ForceShutdown));
        assert_eq!(
            recorder.calls(),
            vec![EffectorCall::Activate(Effect::ForceShutdown)]
        );
    }

    #[test]
    fn stop_during_grace_cancels() {
        let recorder = RecordingEffectors::new();
        let stop = StopSignal::new();
        let timing = TerminalTiming {
            shutdown_grace: Duration::from_secs(30),
            ..fast()
        };
        let (tx, rx) = mpsc::channel();
        let handle = spawn(
            Effect::ForceShutdown,
            timing,
            recorder.effector_set(),
            stop.clone(),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        )
        .unwrap();
        stop.stop();
        handle.join().unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            CountdownOutcome::Cancelled(Effect::ForceShutdown)
        );
        assert!(recorder.calls().is_empty());
    }
}
