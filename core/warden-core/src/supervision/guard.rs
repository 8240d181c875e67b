//! Tier 2: keeps the agent alive inside the monitoring window and dead
//! outside it.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use warden_protocol::parse_config;

use super::{terminate_all, ProcessTable, Registration, ServiceManager, ServiceState, SessionLauncher};
use crate::rules::MonitoringWindow;
use crate::store::FileLease;

/// The guard's own copy of the monitoring window, reloaded when
/// `config.json` changes on disk. A config that fails to parse keeps the
/// last good window.
pub struct WindowSource {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    window: Option<MonitoringWindow>,
}

impl WindowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
            window: None,
        }
    }

    pub fn window(&self) -> Option<&MonitoringWindow> {
        self.window.as_ref()
    }

    /// Reloads when the modification time moved. Returns true on reload.
    pub fn refresh(&mut self) -> bool {
        let modified = match fs_err::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                // No config: nothing to monitor.
                if self.last_modified.take().is_some() {
                    info!(path = %self.path.display(), "Config removed; monitoring window cleared");
                }
                self.window = None;
                return false;
            }
        };
        if self.last_modified == Some(modified) {
            return false;
        }
        self.last_modified = Some(modified);

        let parsed = fs_err::read(&self.path)
            .map_err(|err| err.to_string())
            .and_then(|bytes| parse_config(&bytes).map_err(|info| info.to_string()));
        match parsed {
            Ok(config) => {
                self.window = MonitoringWindow::from_config(&config);
                info!(window = ?self.window, "Monitoring window reloaded");
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Config unreadable; keeping last window");
                false
            }
        }
    }
}

/// What one guard pass observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardPass {
    pub reloaded: bool,
    pub in_window: bool,
    pub agents_found: usize,
    pub installed: bool,
    pub launched: bool,
    pub survivors: usize,
    pub lease_held: bool,
}

pub struct Guard {
    window: WindowSource,
    services: Box<dyn ServiceManager>,
    processes: Box<dyn ProcessTable>,
    launcher: Box<dyn SessionLauncher>,
    agent: Registration,
    agent_process: String,
    terminate_attempts: u32,
    terminate_pause: Duration,
    exe_lease: Option<FileLease>,
}

impl Guard {
    pub fn new(
        window: WindowSource,
        services: Box<dyn ServiceManager>,
        processes: Box<dyn ProcessTable>,
        launcher: Box<dyn SessionLauncher>,
        agent: Registration,
        agent_process: impl Into<String>,
    ) -> Self {
        Self {
            window,
            services,
            processes,
            launcher,
            agent,
            agent_process: agent_process.into(),
            terminate_attempts: 5,
            terminate_pause: Duration::from_millis(500),
            exe_lease: None,
        }
    }

    pub fn with_termination(mut self, attempts: u32, pause: Duration) -> Self {
        self.terminate_attempts = attempts.max(1);
        self.terminate_pause = pause;
        self
    }

    pub fn window(&self) -> Option<&MonitoringWindow> {
        self.window.window()
    }

    pub fn holds_exe_lease(&self) -> bool {
        self.exe_lease.is_some()
    }

    pub fn reconcile(&mut self, now: DateTime<Local>) -> GuardPass {
        let mut pass = GuardPass {
            reloaded: self.window.refresh(),
            ..GuardPass::default()
        };
        pass.in_window = self
            .window
            .window()
            .map(|window| window.contains(now))
            .unwrap_or(false);

        let agents = self.processes.find(&self.agent_process);
        pass.agents_found = agents.len();

        if pass.in_window {
            self.hold_exe_lease();
            pass.installed = self.ensure_agent_registration();
            if agents.is_empty() {
                match self.launcher.launch() {
                    Ok(()) => {
                        info!("Agent absent inside monitoring window; launched");
                        pass.launched = true;
                    }
                    Err(err) => warn!(error = %err, "Agent launch failed"),
                }
            }
        } else {
            self.release_exe_lease();
            if !agents.is_empty() {
                info!(count = agents.len(), "Agent running outside monitoring window; terminating");
                pass.survivors = terminate_all(
                    self.processes.as_ref(),
                    &self.agent_process,
                    self.terminate_attempts,
                    self.terminate_pause,
                );
                if pass.survivors > 0 {
                    warn!(survivors = pass.survivors, "Agent survived termination; retrying next pass");
                }
            }
        }
        pass.lease_held = self.exe_lease.is_some();
        pass
    }

    /// Drops every lease. Used when the guard itself stops.
    pub fn release(&mut self) {
        self.release_exe_lease();
    }

    fn ensure_agent_registration(&self) -> bool {
        if self.services.query(&self.agent.name) != ServiceState::Missing {
            return false;
        }
        match self.services.install(&self.agent) {
            Ok(()) => {
                info!(name = %self.agent.name, "Agent registration recreated");
                true
            }
            Err(err) => {
                warn!(name = %self.agent.name, error = %err, "Agent registration failed");
                false
            }
        }
    }

    fn hold_exe_lease(&mut self) {
        if self.exe_lease.is_some() {
            return;
        }
        let exe = self.agent.program.clone();
        if !exe.exists() {
            debug!(path = %exe.display(), "Agent executable not found; no lease");
            return;
        }
        match FileLease::acquire(&exe) {
            Ok(lease) => {
                debug!(path = %exe.display(), "Holding agent executable");
                self.exe_lease = Some(lease);
            }
            Err(err) => warn!(path = %exe.display(), error = %err, "Failed to lease agent executable"),
        }
    }

    fn release_exe_lease(&mut self) {
        if let Some(lease) = self.exe_lease.take() {
            debug!(path = %lease.path().display(), "Released agent executable");
        }
    }
}

/// Path of the agent executable next to `exe` (the running binary).
pub fn sibling_executable(exe: &Path, name: &str) -> PathBuf {
    let file = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };
    exe.parent()
        .map(|dir| dir.join(&file))
        .unwrap_or_else(|| PathBuf::from(file))
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakeLauncher, FakeSystem};
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use warden_protocol::AgentConfig;

    fn write_config(dir: &TempDir, start: DateTime<Local>, end: DateTime<Local>) -> PathBuf {
        let path = dir.path().join("config.json");
        let config = AgentConfig {
            rules: "Goal: write".to_string(),
            start_time: Some(start),
            end_time: Some(end),
            ..AgentConfig::default()
        };
        fs_err::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
        path
    }

    fn bump_mtime(path: &Path) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();
    }

    fn guard(dir: &TempDir, config: PathBuf, system: &FakeSystem) -> Guard {
        let exe = dir.path().join("warden-agent");
        fs_err::write(&exe, b"#!/bin/sh\n").unwrap();
        Guard::new(
            WindowSource::new(config),
            Box::new(system.clone()),
            Box::new(system.clone()),
            Box::new(FakeLauncher {
                system: system.clone(),
                process: "warden-agent".to_string(),
            }),
            Registration::new("warden-agent", exe),
            "warden-agent",
        )
        .with_termination(3, Duration::from_millis(1))
    }

    #[test]
    fn inside_window_installs_launches_and_leases() {
        let dir = TempDir::new().unwrap();
        let now = Local::now();
        let config = write_config(&dir, now - ChronoDuration::minutes(5), now + ChronoDuration::minutes(30));
        let system = FakeSystem::new();
        let mut guard = guard(&dir, config, &system);

        let pass = guard.reconcile(now);
        assert!(pass.reloaded);
        assert!(pass.in_window);
        assert!(pass.installed);
        assert!(pass.launched);
        assert!(pass.lease_held);
        assert_eq!(system.running("warden-agent"), 1);

        // Agent alive: nothing more to do.
        let pass = guard.reconcile(now);
        assert!(!pass.reloaded);
        assert!(!pass.launched);
        assert!(!pass.installed);
        assert_eq!(system.launches(), 1);
    }

    #[test]
    fn outside_window_terminates_and_releases() {
        let dir = TempDir::new().unwrap();
        let now = Local::now();
        let config = write_config(&dir, now - ChronoDuration::minutes(60), now - ChronoDuration::minutes(1));
        let system = FakeSystem::new();
        system.spawn_process("warden-agent");
        system.spawn_process("warden-agent");
        let mut guard = guard(&dir, config, &system);

        let pass = guard.reconcile(now);
        assert!(!pass.in_window);
        assert_eq!(pass.agents_found, 2);
        assert_eq!(pass.survivors, 0);
        assert!(!pass.launched);
        assert!(!guard.holds_exe_lease());
        assert_eq!(system.running("warden-agent"), 0);
    }

    #[test]
    fn window_follows_config_rewrites() {
        let dir = TempDir::new().unwrap();
        let now = Local::now();
        let config = write_config(&dir, now + ChronoDuration::hours(1), now + ChronoDuration::hours(2));
        let system = FakeSystem::new();
        let mut guard = guard(&dir, config.clone(), &system);
        assert!(!guard.reconcile(now).in_window);

        write_config(&dir, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1));
        bump_mtime(&config);

        let pass = guard.reconcile(now);
        assert!(pass.reloaded);
        assert!(pass.in_window);
    }

    #[test]
    fn corrupt_config_keeps_last_window() {
        let dir = TempDir::new().unwrap();
        let now = Local::now();
        let config = write_config(&dir, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1));
        let mut source = WindowSource::new(config.clone());
        assert!(source.refresh());
        let window = *source.window().unwrap();

        fs_err::write(&config, b"{ not json").unwrap();
        bump_mtime(&config);
        assert!(!source.refresh());
        assert_eq!(source.window(), Some(&window));
    }

    #[test]
    fn missing_config_means_no_window() {
        let dir = TempDir::new().unwrap();
        let mut source = WindowSource::new(dir.path().join("config.json"));
        assert!(!source.refresh());
        assert!(source.window().is_none());
    }

    #[test]
    fn sibling_executable_sits_next_to_binary() {
        let path = sibling_executable(Path::new("/opt/warden/bin/warden"), "warden-agent");
        if cfg!(windows) {
            assert_eq!(path, PathBuf::from("/opt/warden/bin/warden-agent.exe"));
        } else {
            assert_eq!(path, PathBuf::from("/opt/warden/bin/warden-agent"));
        }
    }
}
