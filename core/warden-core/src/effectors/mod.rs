//! Intervention capabilities behind a platform-independent interface.
//!
//! The escalation engine only sees [`Capability`] and [`Notifier`]. Concrete
//! mechanisms are external commands, the pointer sampler, or test doubles.
//! A failing or missing capability is logged by the caller and never stops
//! the rest of a level's interventions.

mod command;
mod desktop;
mod pointer;

pub use command::{CommandCapability, CommandNotifier, Trigger};
pub use desktop::{DesktopHandle, DesktopThread, OnDesktop};
pub use pointer::{Pointer, PointerInversion, XdotoolPointer};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, WardenError};
use crate::escalation::Effect;
use crate::tuning::Tuning;

pub trait Capability: Send + Sync {
    fn activate(&self) -> Result<()>;
    fn deactivate(&self) -> Result<()>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str) -> Result<()>;
}

/// Capability per effect. Cheap to clone; capabilities are shared.
#[derive(Clone, Default)]
pub struct EffectorSet {
    capabilities: BTreeMap<Effect, Arc<dyn Capability>>,
}

impl EffectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, effect: Effect, capability: Arc<dyn Capability>) {
        self.capabilities.insert(effect, capability);
    }

    pub fn with(mut self, effect: Effect, capability: Arc<dyn Capability>) -> Self {
        self.insert(effect, capability);
        self
    }

    pub fn supports(&self, effect: Effect) -> bool {
        self.capabilities.contains_key(&effect)
    }

    pub fn activate(&self, effect: Effect) -> Result<()> {
        self.get(effect)?.activate()
    }

    pub fn deactivate(&self, effect: Effect) -> Result<()> {
        self.get(effect)?.deactivate()
    }

    fn get(&self, effect: Effect) -> Result<&Arc<dyn Capability>> {
        self.capabilities
            .get(&effect)
            .ok_or_else(|| WardenError::EffectorUnsupported(effect.to_string()))
    }

    /// Platform defaults with `[effectors.*]` overrides applied.
    ///
    /// Input-affecting capabilities run on `desktop` when one is given.
    pub fn from_tuning(tuning: &Tuning, desktop: Option<&DesktopHandle>) -> Self {
        let mut set = Self::new();
        for effect in Effect::ALL {
            let spec = tuning.effectors.get(effect.key());
            let activate = spec
                .and_then(|spec| spec.activate.clone())
                .or_else(|| command::default_activate(effect));
            let deactivate = spec
                .and_then(|spec| spec.deactivate.clone())
                .or_else(|| command::default_deactivate(effect));

            let capability: Arc<dyn Capability> = match (effect, activate) {
                (Effect::PointerInversion, None) => match XdotoolPointer::detect() {
                    Some(pointer) => Arc::new(PointerInversion::new(
                        Arc::new(pointer),
                        Duration::from_millis(tuning.pointer.interval_ms.max(1)),
                        tuning.pointer.gain,
                    )),
                    None => {
                        debug!(%effect, "No pointer primitive on this desktop");
                        continue;
                    }
                },
                (_, None) => {
                    debug!(%effect, "No capability configured");
                    continue;
                }
                (_, Some(activate)) => {
                    let trigger = if effect.is_persistent() {
                        Trigger::Toggle
                    } else {
                        Trigger::EveryTime
                    };
                    Arc::new(CommandCapability::new(effect, activate, deactivate, trigger))
                }
            };

            let capability = match (effect, desktop) {
                (Effect::InputDelay | Effect::PointerInversion, Some(desktop)) => {
                    Arc::new(OnDesktop::new(capability, desktop.clone())) as Arc<dyn Capability>
                }
                _ => capability,
            };
            set.insert(effect, capability);
        }
        set
    }
}

/// Does nothing. Stands in on platforms without a mechanism.
pub struct NoopCapability;

impl Capability for NoopCapability {
    fn activate(&self) -> Result<()> {
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        Ok(())
    }
}

/// Notifications that only reach the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        warn!(title, message, "Intervention notice");
        Ok(())
    }
}

/// Desktop notifications when the session can show them, the log otherwise.
pub fn default_notifier() -> Arc<dyn Notifier> {
    notifier_for(CommandNotifier::detect())
}

fn notifier_for(desktop: Option<CommandNotifier>) -> Arc<dyn Notifier> {
    match desktop {
        Some(notifier) => Arc::new(notifier),
        None => {
            debug!("No graphical session; notices go to the log");
            Arc::new(LogNotifier)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recording doubles
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectorCall {
    Activate(Effect),
    Deactivate(Effect),
    Notify(String),
}

/// Records every call instead of touching the desktop.
#[derive(Clone, Default)]
pub struct RecordingEffectors {
    calls: Arc<Mutex<Vec<EffectorCall>>>,
    failing: Arc<Mutex<BTreeSet<Effect>>>,
}

impl RecordingEffectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effector_set(&self) -> EffectorSet {
        let mut set = EffectorSet::new();
        for effect in Effect::ALL {
            set.insert(
                effect,
                Arc::new(RecordingCapability {
                    effect,
                    log: self.clone(),
                }),
            );
        }
        set
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.clone())
    }

    /// Makes every later activation of `effect` fail.
    pub fn fail(&self, effect: Effect) {
        lock(&self.failing).insert(effect);
    }

    pub fn calls(&self) -> Vec<EffectorCall> {
        lock(&self.calls).clone()
    }

    pub fn take(&self) -> Vec<EffectorCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    pub fn notifications(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EffectorCall::Notify(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Persistent effects currently switched on, replaying the call log.
    pub fn active(&self) -> BTreeSet<Effect> {
        let mut active = BTreeSet::new();
        for call in lock(&self.calls).iter() {
            match call {
                EffectorCall::Activate(effect) if effect.is_persistent() => {
                    active.insert(*effect);
                }
                EffectorCall::Deactivate(effect) => {
                    active.remove(effect);
                }
                _ => {}
            }
        }
        active
    }

    fn record(&self, call: EffectorCall) {
        lock(&self.calls).push(call);
    }
}

impl Notifier for RecordingEffectors {
    fn notify(&self, _title: &str, message: &str) -> Result<()> {
        self.record(EffectorCall::Notify(message.to_string()));
        Ok(())
    }
}

struct RecordingCapability {
    effect: Effect,
    log: RecordingEffectors,
}

impl Capability for RecordingCapability {
    fn activate(&self) -> Result<()> {
        if lock(&self.log.failing).contains(&self.effect) {
            return Err(WardenError::effector(self.effect, "simulated failure"));
        }
        self.log.record(EffectorCall::Activate(self.effect));
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        self.log.record(EffectorCall::Deactivate(self.effect));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::CommandSpec;

    #[test]
    fn missing_capability_is_unsupported() {
        let set = EffectorSet::new().with(Effect::Desaturate, Arc::new(NoopCapability));
        assert!(set.activate(Effect::Desaturate).is_ok());
        assert!(matches!(
            set.activate(Effect::InputDelay),
            Err(WardenError::EffectorUnsupported(_))
        ));
    }

    #[test]
    fn recording_tracks_active_set() {
        let recorder = RecordingEffectors::new();
        let set = recorder.effector_set();
        set.activate(Effect::InputDelay).unwrap();
        set.activate(Effect::AudioAlert).unwrap();
        set.activate(Effect::Desaturate).unwrap();
        set.deactivate(Effect::InputDelay).unwrap();
        assert_eq!(
            recorder.active().into_iter().collect::<Vec<_>>(),
            vec![Effect::Desaturate]
        );

        recorder.fail(Effect::PointerInversion);
        assert!(set.activate(Effect::PointerInversion).is_err());
        assert!(!recorder.active().contains(&Effect::PointerInversion));
    }

    #[test]
    fn headless_session_notifies_through_the_log() {
        let notifier = notifier_for(None);
        assert!(notifier.notify("Warden", "Level 1 reached").is_ok());
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut tuning = Tuning::default();
        tuning.effectors.insert(
            "desaturate".to_string(),
            CommandSpec {
                activate: Some(vec!["true".to_string()]),
                deactivate: Some(vec!["true".to_string()]),
            },
        );
        let set = EffectorSet::from_tuning(&tuning, None);
        assert!(set.supports(Effect::Desaturate));
        assert!(set.supports(Effect::ForceLock));
        assert!(!set.supports(Effect::InputDelay));
    }
}
