//! Tier 2 and tier 3 loops and their platform wiring.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};
use warden_core::supervision::{
    ensure_registered, sibling_executable, Guard, GuardPass, Registration,
    Sentinel, SentinelPass, ServiceManager, SessionLauncher, SysinfoProcessTable, WindowSource,
};
use warden_core::tuning::SupervisionTuning;
use warden_core::{config::HOME_ENV, Paths, StopSignal};

const AGENT_BINARY: &str = "warden-agent";

/// Registrations for the three tiers, all pointing at the same monitoring
/// directory.
pub struct Registrations {
    pub agent: Registration,
    pub guard: Registration,
    pub sentinel: Registration,
}

impl Registrations {
    pub fn build(paths: &Paths, tuning: &SupervisionTuning, current_exe: &Path) -> Self {
        let home = paths.root().display().to_string();
        let warden_exe = tuning
            .guard_exe
            .clone()
            .unwrap_or_else(|| current_exe.to_path_buf());
        let agent_exe = tuning
            .agent_exe
            .clone()
            .unwrap_or_else(|| sibling_executable(&warden_exe, AGENT_BINARY));

        Self {
            agent: Registration::new(&tuning.agent_unit, agent_exe)
                .description("Warden monitoring agent")
                .env(HOME_ENV, &home),
            guard: Registration::new(&tuning.guard_unit, warden_exe.clone())
                .description("Warden guard: keeps the agent inside its window")
                .arg("guard")
                .env(HOME_ENV, &home),
            sentinel: Registration::new(&tuning.sentinel_unit, warden_exe)
                .description("Warden sentinel: keeps the guard registered")
                .arg("sentinel")
                .env(HOME_ENV, &home),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Platform wiring
// ─────────────────────────────────────────────────────────────────────────────

/// OS mechanisms the tiers are registered and launched with.
struct Platform {
    tier_services: Box<dyn ServiceManager>,
    agent_services: Box<dyn ServiceManager>,
    agent_launcher: Box<dyn SessionLauncher>,
}

impl Platform {
    #[cfg(not(windows))]
    fn detect(tuning: &SupervisionTuning) -> Self {
        use warden_core::supervision::{SystemdManager, SystemdScope, SystemdUserLauncher};
        let agent_scope = match &tuning.session_user {
            Some(user) => SystemdScope::SessionOf(user.clone()),
            None => SystemdScope::User,
        };
        Self {
            tier_services: Box::new(SystemdManager::new(SystemdScope::System)),
            agent_services: Box::new(SystemdManager::new(agent_scope)),
            agent_launcher: Box::new(SystemdUserLauncher::new(
                tuning.session_user.clone(),
                tuning.agent_unit.clone(),
            )),
        }
    }

    #[cfg(windows)]
    fn detect(tuning: &SupervisionTuning) -> Self {
        use warden_core::supervision::{ScManager, ScheduledTaskLauncher, ScheduledTaskManager};
        Self {
            tier_services: Box::new(ScManager),
            agent_services: Box::new(ScheduledTaskManager),
            agent_launcher: Box::new(ScheduledTaskLauncher::new(tuning.agent_unit.clone())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loops
// ─────────────────────────────────────────────────────────────────────────────

pub fn run_guard(paths: &Paths, tuning: &SupervisionTuning, current_exe: PathBuf, stop: &StopSignal) {
    let registrations = Registrations::build(paths, tuning, &current_exe);
    let platform = Platform::detect(tuning);

    // Mutual installation: the guard puts its own supervisor back first.
    let sentinel_state = ensure_registered(platform.tier_services.as_ref(), &registrations.sentinel, true);
    info!(state = ?sentinel_state, unit = %registrations.sentinel.name, "Sentinel checked");

    let mut guard = Guard::new(
        WindowSource::new(paths.config()),
        platform.agent_services,
        Box::new(SysinfoProcessTable::new()),
        platform.agent_launcher,
        registrations.agent,
        tuning.agent_process.clone(),
    )
    .with_termination(
        tuning.terminate_attempts,
        Duration::from_millis(tuning.terminate_pause_ms),
    );

    info!(interval_secs = tuning.interval().as_secs(), "Guard started");
    guard_loop(&mut guard, tuning.interval(), stop);
    guard.release();
    info!("Guard stopped");
}

pub fn guard_loop(guard: &mut Guard, interval: Duration, stop: &StopSignal) {
    loop {
        let pass = guard.reconcile(Local::now());
        log_guard_pass(&pass);
        if stop.wait(interval) {
            break;
        }
    }
}

fn log_guard_pass(pass: &GuardPass) {
    if pass.survivors > 0 {
        error!(survivors = pass.survivors, "Agent outlived termination attempts");
    }
    if pass.installed || pass.launched {
        info!(
            installed = pass.installed,
            launched = pass.launched,
            "Agent restored"
        );
    }
    debug!(
        in_window = pass.in_window,
        agents = pass.agents_found,
        lease = pass.lease_held,
        "Guard pass"
    );
}

pub fn run_sentinel(paths: &Paths, tuning: &SupervisionTuning, current_exe: PathBuf, stop: &StopSignal) {
    let registrations = Registrations::build(paths, tuning, &current_exe);
    let mut sentinel = Sentinel::new(Platform::detect(tuning).tier_services, registrations.guard);
    info!(interval_secs = tuning.interval().as_secs(), "Sentinel started");
    sentinel_loop(&mut sentinel, tuning.interval(), stop);
    info!("Sentinel stopped");
}

pub fn sentinel_loop(sentinel: &mut Sentinel, interval: Duration, stop: &StopSignal) {
    loop {
        let pass = sentinel.reconcile();
        log_sentinel_pass(&pass);
        if stop.wait(interval) {
            break;
        }
    }
}

fn log_sentinel_pass(pass: &SentinelPass) {
    if pass.reinstalled {
        warn!(state = ?pass.guard_state, "Guard registration was missing; reinstalled");
    }
    debug!(state = ?pass.guard_state, drift = ?pass.clock_drift, "Sentinel pass");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use warden_core::supervision::fake::{FakeLauncher, FakeSystem};
    use warden_core::CoordinationStore;
    use warden_protocol::AgentConfig;

    fn tuning() -> SupervisionTuning {
        SupervisionTuning::default()
    }

    #[test]
    fn registrations_share_the_monitoring_directory() {
        let paths = Paths::new("/var/lib/warden");
        let regs = Registrations::build(&paths, &tuning(), Path::new("/usr/local/bin/warden"));

        for reg in [&regs.agent, &regs.guard, &regs.sentinel] {
            assert_eq!(
                reg.env,
                vec![(HOME_ENV.to_string(), "/var/lib/warden".to_string())]
            );
        }
        assert_eq!(regs.guard.args, vec!["guard".to_string()]);
        assert_eq!(regs.sentinel.args, vec!["sentinel".to_string()]);
        assert_eq!(
            regs.agent.program,
            sibling_executable(Path::new("/usr/local/bin/warden"), AGENT_BINARY)
        );
    }

    #[test]
    fn configured_executables_win() {
        let paths = Paths::new("/srv/warden");
        let tuning = SupervisionTuning {
            agent_exe: Some(PathBuf::from("/opt/warden/agent")),
            ..tuning()
        };
        let regs = Registrations::build(&paths, &tuning, Path::new("/usr/bin/warden"));
        assert_eq!(regs.agent.program, PathBuf::from("/opt/warden/agent"));
        assert_eq!(regs.guard.program, PathBuf::from("/usr/bin/warden"));
    }

    #[test]
    fn guard_loop_runs_until_stopped() {
        let dir = TempDir::new().unwrap();
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        let now = Local::now();
        store
            .write_config(&AgentConfig {
                rules: "Goal: read".to_string(),
                start_time: Some(now - ChronoDuration::minutes(1)),
                end_time: Some(now + ChronoDuration::hours(1)),
                ..AgentConfig::default()
            })
            .unwrap();
        let exe = dir.path().join(AGENT_BINARY);
        fs_err::write(&exe, b"agent").unwrap();

        let system = FakeSystem::new();
        let mut guard = Guard::new(
            WindowSource::new(store.paths().config()),
            Box::new(system.clone()),
            Box::new(system.clone()),
            Box::new(FakeLauncher {
                system: system.clone(),
                process: AGENT_BINARY.to_string(),
            }),
            Registration::new(AGENT_BINARY, exe),
            AGENT_BINARY,
        );

        let stop = StopSignal::new();
        stop.stop();
        guard_loop(&mut guard, Duration::from_millis(10), &stop);
        assert_eq!(system.running(AGENT_BINARY), 1);
        assert!(guard.holds_exe_lease());
    }
}
