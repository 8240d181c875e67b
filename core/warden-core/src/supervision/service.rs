//! Service registrations through the platform service manager.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use super::{Registration, ServiceManager, ServiceState};
use crate::error::{Result, WardenError};
use crate::exec;

const MANAGER_TIMEOUT: Duration = Duration::from_secs(15);

// ─────────────────────────────────────────────────────────────────────────────
// systemd
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemdScope {
    /// System units in `/etc/systemd/system`.
    System,
    /// The calling user's units.
    User,
    /// Global user units in `/etc/systemd/user`, queried and started in the
    /// session of `user` from a system service.
    SessionOf(String),
}

pub struct SystemdManager {
    scope: SystemdScope,
    unit_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(scope: SystemdScope) -> Self {
        let unit_dir = match &scope {
            SystemdScope::System => PathBuf::from("/etc/systemd/system"),
            SystemdScope::User => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join("systemd/user"),
            SystemdScope::SessionOf(_) => PathBuf::from("/etc/systemd/user"),
        };
        Self { scope, unit_dir }
    }

    pub fn with_unit_dir(mut self, unit_dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = unit_dir.into();
        self
    }

    fn scope_args(&self) -> Vec<String> {
        match &self.scope {
            SystemdScope::System => Vec::new(),
            SystemdScope::User => vec!["--user".to_string()],
            SystemdScope::SessionOf(user) => {
                vec!["--user".to_string(), format!("--machine={}@", user)]
            }
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<exec::ExecOutput> {
        let mut argv = vec!["systemctl".to_string()];
        argv.extend(self.scope_args());
        argv.extend(args.iter().map(|arg| arg.to_string()));
        exec::run_argv(&argv, MANAGER_TIMEOUT)
    }

    fn unit_name(name: &str) -> String {
        if name.ends_with(".service") {
            name.to_string()
        } else {
            format!("{}.service", name)
        }
    }
}

/// Renders a unit that restarts forever.
pub fn systemd_unit(registration: &Registration, wanted_by: &str) -> String {
    let mut exec_start = quote_systemd(&registration.program.to_string_lossy());
    for arg in &registration.args {
        exec_start.push(' ');
        exec_start.push_str(&quote_systemd(arg));
    }
    let environment: String = registration
        .env
        .iter()
        .map(|(key, value)| format!("Environment=\"{}={}\"\n", key, value))
        .collect();
    format!(
        "[Unit]\n\
         Description={description}\n\
         StartLimitIntervalSec=0\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec_start}\n\
         {environment}\
         Restart=always\n\
         RestartSec=1\n\
         \n\
         [Install]\n\
         WantedBy={wanted_by}\n",
        description = registration.description,
    )
}

fn quote_systemd(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.contains('"') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Maps `systemctl show -p LoadState -p ActiveState` output to a state.
pub fn parse_systemd_show(output: &str) -> ServiceState {
    let mut load = "";
    let mut active = "";
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("LoadState=") {
            load = value.trim();
        } else if let Some(value) = line.strip_prefix("ActiveState=") {
            active = value.trim();
        }
    }
    match (load, active) {
        ("", _) | ("not-found", _) => ServiceState::Missing,
        (_, "active" | "activating" | "reloading") => ServiceState::Running,
        _ => ServiceState::Stopped,
    }
}

impl ServiceManager for SystemdManager {
    fn query(&self, name: &str) -> ServiceState {
        let unit = Self::unit_name(name);
        match self.systemctl(&["show", "-p", "LoadState", "-p", "ActiveState", &unit]) {
            Ok(output) if output.status.success() => parse_systemd_show(&output.stdout),
            Ok(output) => {
                debug!(unit = %unit, stderr = %output.stderr.trim(), "systemctl show failed");
                ServiceState::Missing
            }
            Err(err) => {
                debug!(unit = %unit, error = %err, "systemctl unavailable");
                ServiceState::Missing
            }
        }
    }

    fn install(&self, registration: &Registration) -> Result<()> {
        let unit = Self::unit_name(&registration.name);
        let wanted_by = match self.scope {
            SystemdScope::System => "multi-user.target",
            _ => "default.target",
        };
        fs_err::create_dir_all(&self.unit_dir)
            .map_err(|err| WardenError::io("Failed to create unit directory", err))?;
        let path = self.unit_dir.join(&unit);
        fs_err::write(&path, systemd_unit(registration, wanted_by))
            .map_err(|err| WardenError::io("Failed to write unit file", err))?;

        match &self.scope {
            SystemdScope::SessionOf(_) => {
                // Global user units are enabled without a running user manager.
                exec::run_checked(
                    &["systemctl", "--global", "enable", unit.as_str()].map(String::from),
                    MANAGER_TIMEOUT,
                )?;
                let _ = self.systemctl(&["daemon-reload"]);
            }
            _ => {
                checked(self.systemctl(&["daemon-reload"]), "daemon-reload")?;
                checked(self.systemctl(&["enable", &unit]), "enable")?;
            }
        }
        info!(unit = %unit, path = %path.display(), "Installed unit");
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let unit = Self::unit_name(name);
        checked(self.systemctl(&["start", &unit]), "start")
    }
}

fn checked(output: Result<exec::ExecOutput>, action: &str) -> Result<()> {
    let output = output?;
    if output.status.success() {
        Ok(())
    } else {
        Err(WardenError::CommandFailed {
            command: format!("systemctl {}", action),
            details: output.combined(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Windows service control manager
// ─────────────────────────────────────────────────────────────────────────────

/// Services through `sc.exe`, with restart-on-failure actions.
pub struct ScManager;

const SC_DOES_NOT_EXIST: i32 = 1060;

fn sc(args: &[&str]) -> Result<exec::ExecOutput> {
    let mut argv = vec!["sc.exe".to_string()];
    argv.extend(args.iter().map(|arg| arg.to_string()));
    exec::run_argv(&argv, MANAGER_TIMEOUT)
}

/// Maps `sc query` output to a state.
pub fn parse_sc_query(code: Option<i32>, output: &str) -> ServiceState {
    if code == Some(SC_DOES_NOT_EXIST) || output.contains(&SC_DOES_NOT_EXIST.to_string()) {
        return ServiceState::Missing;
    }
    let state_line = output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"));
    match state_line {
        Some(line) if line.contains("RUNNING") || line.contains("START_PENDING") => {
            ServiceState::Running
        }
        Some(_) => ServiceState::Stopped,
        None => ServiceState::Missing,
    }
}

impl ServiceManager for ScManager {
    fn query(&self, name: &str) -> ServiceState {
        match sc(&["query", name]) {
            Ok(output) => parse_sc_query(output.status.code(), &output.stdout),
            Err(err) => {
                debug!(service = name, error = %err, "sc query failed");
                ServiceState::Missing
            }
        }
    }

    fn install(&self, registration: &Registration) -> Result<()> {
        let mut bin_path = format!("\"{}\"", registration.program.display());
        for arg in &registration.args {
            bin_path.push(' ');
            bin_path.push_str(arg);
        }
        let name = registration.name.as_str();
        let created = sc(&["create", name, "binPath=", &bin_path, "start=", "auto"])?;
        if !created.status.success() {
            return Err(WardenError::CommandFailed {
                command: "sc create".to_string(),
                details: created.combined(),
            });
        }
        let _ = sc(&["description", name, &registration.description]);
        let _ = sc(&[
            "failure",
            name,
            "reset=",
            "0",
            "actions=",
            "restart/1000/restart/1000/restart/1000",
        ]);
        info!(service = name, "Installed service");
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let output = sc(&["start", name])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WardenError::CommandFailed {
                command: "sc start".to_string(),
                details: output.combined(),
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Windows task scheduler (agent registration)
// ─────────────────────────────────────────────────────────────────────────────

/// Logon tasks through `schtasks`. Tasks run in the interactive session,
/// which services cannot.
pub struct ScheduledTaskManager;

fn schtasks(args: &[&str]) -> Result<exec::ExecOutput> {
    let mut argv = vec!["schtasks".to_string()];
    argv.extend(args.iter().map(|arg| arg.to_string()));
    exec::run_argv(&argv, MANAGER_TIMEOUT)
}

/// Maps `schtasks /Query /FO LIST` output to a state.
pub fn parse_schtasks_query(success: bool, output: &str) -> ServiceState {
    if !success {
        return ServiceState::Missing;
    }
    let running = output.lines().any(|line| {
        line.trim_start().starts_with("Status:") && line.contains("Running")
    });
    if running {
        ServiceState::Running
    } else {
        ServiceState::Stopped
    }
}

impl ServiceManager for ScheduledTaskManager {
    fn query(&self, name: &str) -> ServiceState {
        match schtasks(&["/Query", "/TN", name, "/FO", "LIST"]) {
            Ok(output) => parse_schtasks_query(output.status.success(), &output.stdout),
            Err(err) => {
                debug!(task = name, error = %err, "schtasks query failed");
                ServiceState::Missing
            }
        }
    }

    fn install(&self, registration: &Registration) -> Result<()> {
        let mut command = format!("\"{}\"", registration.program.display());
        for arg in &registration.args {
            command.push(' ');
            command.push_str(arg);
        }
        let name = registration.name.as_str();
        let output = schtasks(&[
            "/Create", "/F", "/TN", name, "/TR", &command, "/SC", "ONLOGON", "/RL", "HIGHEST",
            "/IT",
        ])?;
        if !output.status.success() {
            return Err(WardenError::CommandFailed {
                command: "schtasks /Create".to_string(),
                details: output.combined(),
            });
        }
        info!(task = name, "Installed logon task");
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let output = schtasks(&["/Run", "/TN", name])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WardenError::CommandFailed {
                command: "schtasks /Run".to_string(),
                details: output.combined(),
            })
        }
    }
}
