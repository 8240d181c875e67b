//! Tier 3: keeps the guard registered.

use tracing::{debug, info};

use super::{ensure_registered, ClockWatch, Registration, ServiceManager, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelPass {
    pub guard_state: ServiceState,
    pub reinstalled: bool,
    pub clock_drift: Option<i64>,
}

pub struct Sentinel {
    services: Box<dyn ServiceManager>,
    guard: Registration,
    clock: ClockWatch,
}

impl Sentinel {
    pub fn new(services: Box<dyn ServiceManager>, guard: Registration) -> Self {
        Self {
            services,
            guard,
            clock: ClockWatch::new(),
        }
    }

    /// Reinstalls the guard only when its registration is gone. A stopped
    /// but registered guard is left alone; its own restart policy applies.
    pub fn reconcile(&mut self) -> SentinelPass {
        let guard_state = ensure_registered(self.services.as_ref(), &self.guard, false);
        let reinstalled = guard_state == ServiceState::Missing;
        if reinstalled {
            info!(service = %self.guard.name, "Guard registration restored");
        } else {
            debug!(service = %self.guard.name, state = ?guard_state, "Guard registered");
        }
        SentinelPass {
            guard_state,
            reinstalled,
            clock_drift: self.clock.check(),
        }
    }
}
