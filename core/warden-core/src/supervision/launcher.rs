//! Hand-off into the interactive session.
//!
//! The guard runs as a system service and cannot put a window or input hook
//! on the user's desktop itself. It asks a per-user mechanism to start the
//! agent instead.

use std::time::Duration;

use tracing::info;

use super::SessionLauncher;
use crate::error::Result;
use crate::exec;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Starts a user unit inside `user`'s systemd session.
pub struct SystemdUserLauncher {
    user: Option<String>,
    unit: String,
}

impl SystemdUserLauncher {
    pub fn new(user: Option<String>, unit: impl Into<String>) -> Self {
        Self {
            user,
            unit: unit.into(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["systemctl".to_string(), "--user".to_string()];
        if let Some(user) = &self.user {
            argv.push(format!("--machine={}@", user));
        }
        argv.push("start".to_string());
        argv.push(if self.unit.ends_with(".service") {
            self.unit.clone()
        } else {
            format!("{}.service", self.unit)
        });
        argv
    }
}

impl SessionLauncher for SystemdUserLauncher {
    fn launch(&self) -> Result<()> {
        exec::run_checked(&self.argv(), LAUNCH_TIMEOUT)?;
        info!(unit = %self.unit, user = ?self.user, "Agent launch requested");
        Ok(())
    }
}

/// Runs a logon scheduled task, which executes in the interactive session.
pub struct ScheduledTaskLauncher {
    task: String,
}

impl ScheduledTaskLauncher {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }

    pub fn argv(&self) -> Vec<String> {
        ["schtasks", "/Run", "/TN", self.task.as_str()]
            .iter()
            .map(|part| part.to_string())
            .collect()
    }
}

impl SessionLauncher for ScheduledTaskLauncher {
    fn launch(&self) -> Result<()> {
        exec::run_checked(&self.argv(), LAUNCH_TIMEOUT)?;
        info!(task = %self.task, "Agent launch requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_launcher_targets_user_session() {
        let launcher = SystemdUserLauncher::new(Some("alice".to_string()), "warden-agent");
        assert_eq!(
            launcher.argv(),
            vec!["systemctl", "--user", "--machine=alice@", "start", "warden-agent.service"]
        );
        let local = SystemdUserLauncher::new(None, "warden-agent.service");
        assert_eq!(
            local.argv(),
            vec!["systemctl", "--user", "start", "warden-agent.service"]
        );
    }

    #[test]
    fn task_launcher_runs_named_task() {
        assert_eq!(
            ScheduledTaskLauncher::new("warden-agent").argv(),
            vec!["schtasks", "/Run", "/TN", "warden-agent"]
        );
    }
}
