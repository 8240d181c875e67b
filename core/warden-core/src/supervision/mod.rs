//! The supervision chain.
//!
//! ```text
//! sentinel (tier 3) ──ensures registered──▶ guard (tier 2) ──window──▶ agent (tier 1)
//!        ▲                                        │
//!        └──────────── ensures registered ────────┘
//! ```
//!
//! Each tier is an idempotent `reconcile` pass run on a fixed interval. The
//! OS-facing pieces sit behind [`ServiceManager`], [`ProcessTable`] and
//! [`SessionLauncher`] so the reconcilers run against in-memory fakes in
//! tests. Failing to observe the tier below is treated as "absent"; nothing
//! here is fatal to the calling loop.

mod clock;
mod guard;
mod launcher;
mod process;
mod sentinel;
mod service;

pub use clock::ClockWatch;
pub use guard::{sibling_executable, Guard, GuardPass, WindowSource};
pub use launcher::{ScheduledTaskLauncher, SystemdUserLauncher};
pub use process::SysinfoProcessTable;
pub use sentinel::{Sentinel, SentinelPass};
pub use service::{ScManager, ScheduledTaskManager, SystemdManager, SystemdScope};

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Missing,
    Stopped,
    Running,
}

/// Everything needed to (re)create one tier's registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub description: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Registration {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub trait ServiceManager: Send {
    /// Query errors are reported as [`ServiceState::Missing`].
    fn query(&self, name: &str) -> ServiceState;
    fn install(&self, registration: &Registration) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
}

pub trait ProcessTable: Send {
    fn find(&self, name: &str) -> Vec<u32>;
    /// Returns true if the signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
}

/// Starts the agent inside the interactive user session.
pub trait SessionLauncher: Send {
    fn launch(&self) -> Result<()>;
}

/// Installs and starts `registration` when it is missing; starts it when
/// stopped and `start_stopped` is set. Returns the state that was observed.
pub fn ensure_registered(
    manager: &dyn ServiceManager,
    registration: &Registration,
    start_stopped: bool,
) -> ServiceState {
    let state = manager.query(&registration.name);
    let needs_start = match state {
        ServiceState::Missing => {
            warn!(service = %registration.name, "Registration missing; reinstalling");
            if let Err(err) = manager.install(registration) {
                warn!(service = %registration.name, error = %err, "Install failed");
                return state;
            }
            true
        }
        ServiceState::Stopped => start_stopped,
        ServiceState::Running => false,
    };
    if needs_start {
        if let Err(err) = manager.start(&registration.name) {
            warn!(service = %registration.name, error = %err, "Start failed");
        }
    }
    state
}

/// Terminates every process called `name`, retrying up to `attempts` rounds.
/// Returns how many were still alive after the last round.
pub fn terminate_all(
    table: &dyn ProcessTable,
    name: &str,
    attempts: u32,
    pause: Duration,
) -> usize {
    for attempt in 0..attempts.max(1) {
        let pids = table.find(name);
        if pids.is_empty() {
            return 0;
        }
        for pid in &pids {
            let delivered = table.terminate(*pid);
            debug!(pid, attempt, delivered, "Terminate sent");
        }
        thread::sleep(pause);
    }
    table.find(name).len()
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory doubles
// ═══════════════════════════════════════════════════════════════════════════════

pub mod fake {
    //! Service manager, process table and launcher kept in memory.

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, MutexGuard};

    use super::*;

    #[derive(Default)]
    struct World {
        services: BTreeMap<String, ServiceState>,
        installs: Vec<Registration>,
        starts: Vec<String>,
        processes: BTreeMap<u32, String>,
        next_pid: u32,
        immortal: Vec<u32>,
        terminations: Vec<u32>,
        launches: u32,
    }

    /// One shared world; every handle sees the same services and processes.
    #[derive(Clone, Default)]
    pub struct FakeSystem {
        world: Arc<Mutex<World>>,
    }

    impl FakeSystem {
        pub fn new() -> Self {
            Self::default()
        }

        fn world(&self) -> MutexGuard<'_, World> {
            self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        pub fn set_service(&self, name: &str, state: ServiceState) {
            self.world().services.insert(name.to_string(), state);
        }

        pub fn remove_service(&self, name: &str) {
            self.world().services.remove(name);
        }

        pub fn service(&self, name: &str) -> ServiceState {
            self.world()
                .services
                .get(name)
                .copied()
                .unwrap_or(ServiceState::Missing)
        }

        pub fn spawn_process(&self, name: &str) -> u32 {
            let mut world = self.world();
            world.next_pid += 1;
            let pid = 1000 + world.next_pid;
            world.processes.insert(pid, name.to_string());
            pid
        }

        /// `pid` ignores termination.
        pub fn make_immortal(&self, pid: u32) {
            self.world().immortal.push(pid);
        }

        pub fn installs(&self) -> Vec<Registration> {
            self.world().installs.clone()
        }

        pub fn starts(&self) -> Vec<String> {
            self.world().starts.clone()
        }

        pub fn terminations(&self) -> Vec<u32> {
            self.world().terminations.clone()
        }

        pub fn launches(&self) -> u32 {
            self.world().launches
        }

        pub fn running(&self, name: &str) -> usize {
            self.world()
                .processes
                .values()
                .filter(|process| process.as_str() == name)
                .count()
        }
    }

    impl ServiceManager for FakeSystem {
        fn query(&self, name: &str) -> ServiceState {
            self.service(name)
        }

        fn install(&self, registration: &Registration) -> Result<()> {
            let mut world = self.world();
            world.installs.push(registration.clone());
            world
                .services
                .insert(registration.name.clone(), ServiceState::Stopped);
            Ok(())
        }

        fn start(&self, name: &str) -> Result<()> {
            let mut world = self.world();
            world.starts.push(name.to_string());
            world.services.insert(name.to_string(), ServiceState::Running);
            Ok(())
        }
    }

    impl ProcessTable for FakeSystem {
        fn find(&self, name: &str) -> Vec<u32> {
            self.world()
                .processes
                .iter()
                .filter(|(_, process)| process.as_str() == name)
                .map(|(pid, _)| *pid)
                .collect()
        }

        fn terminate(&self, pid: u32) -> bool {
            let mut world = self.world();
            world.terminations.push(pid);
            if world.immortal.contains(&pid) {
                return false;
            }
            world.processes.remove(&pid).is_some()
        }
    }

    /// Launching spawns a process with the given name in the shared world.
    pub struct FakeLauncher {
        pub system: FakeSystem,
        pub process: String,
    }

    impl SessionLauncher for FakeLauncher {
        fn launch(&self) -> Result<()> {
            self.system.world().launches += 1;
            self.system.spawn_process(&self.process);
            Ok(())
        }
    }
}
