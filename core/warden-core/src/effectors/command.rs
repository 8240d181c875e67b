use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::{Capability, Notifier};
use crate::error::{Result, WardenError};
use crate::escalation::Effect;
use crate::exec;

const EFFECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// On until deactivated; repeated activation is a no-op.
    Toggle,
    /// Runs on every activation; deactivation does nothing without a command.
    EveryTime,
}

/// An effect implemented by external commands.
pub struct CommandCapability {
    effect: Effect,
    activate: Vec<String>,
    deactivate: Option<Vec<String>>,
    trigger: Trigger,
    active: AtomicBool,
}

impl CommandCapability {
    pub fn new(
        effect: Effect,
        activate: Vec<String>,
        deactivate: Option<Vec<String>>,
        trigger: Trigger,
    ) -> Self {
        Self {
            effect,
            activate,
            deactivate,
            trigger,
            active: AtomicBool::new(false),
        }
    }

    fn run(&self, argv: &[String]) -> Result<()> {
        exec::run_checked(argv, EFFECT_TIMEOUT)
            .map(|_| ())
            .map_err(|err| WardenError::effector(self.effect, err.to_string()))
    }
}

impl Capability for CommandCapability {
    fn activate(&self) -> Result<()> {
        if self.trigger == Trigger::Toggle && self.active.load(Ordering::SeqCst) {
            debug!(effect = %self.effect, "Already active");
            return Ok(());
        }
        self.run(&self.activate)?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        if self.trigger == Trigger::Toggle && !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(argv) = &self.deactivate {
            self.run(argv)?;
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

pub(super) fn default_activate(effect: Effect) -> Option<Vec<String>> {
    match effect {
        Effect::ForceLock => Some(lock_command()),
        Effect::ForceShutdown => Some(shutdown_command()),
        Effect::AudioAlert => Some(alert_command()),
        Effect::InputDelay | Effect::Desaturate | Effect::PointerInversion => None,
    }
}

pub(super) fn default_deactivate(_effect: Effect) -> Option<Vec<String>> {
    None
}

#[cfg(target_os = "linux")]
fn lock_command() -> Vec<String> {
    argv(&["loginctl", "lock-session"])
}

#[cfg(windows)]
fn lock_command() -> Vec<String> {
    argv(&["rundll32.exe", "user32.dll,LockWorkStation"])
}

#[cfg(target_os = "macos")]
fn lock_command() -> Vec<String> {
    argv(&["pmset", "displaysleepnow"])
}

#[cfg(target_os = "linux")]
fn shutdown_command() -> Vec<String> {
    argv(&["systemctl", "poweroff"])
}

#[cfg(windows)]
fn shutdown_command() -> Vec<String> {
    argv(&["shutdown", "/s", "/f", "/t", "0"])
}

#[cfg(target_os = "macos")]
fn shutdown_command() -> Vec<String> {
    argv(&["shutdown", "-h", "now"])
}

#[cfg(target_os = "linux")]
fn alert_command() -> Vec<String> {
    argv(&[
        "sh",
        "-c",
        "pactl set-sink-mute @DEFAULT_SINK@ 0; pactl set-sink-volume @DEFAULT_SINK@ 80%; \
         for i in 1 2 3; do paplay /usr/share/sounds/freedesktop/stereo/alarm-clock-elapsed.oga; done",
    ])
}

#[cfg(windows)]
fn alert_command() -> Vec<String> {
    argv(&[
        "powershell",
        "-NoProfile",
        "-Command",
        "$w = New-Object -ComObject WScript.Shell; $w.SendKeys([char]175); \
         1..3 | ForEach-Object { [console]::beep(2000,200); [console]::beep(1000,200) }",
    ])
}

#[cfg(target_os = "macos")]
fn alert_command() -> Vec<String> {
    argv(&[
        "osascript",
        "-e",
        "set volume without output muted",
        "-e",
        "set volume output volume 80",
        "-e",
        "beep 3",
    ])
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn lock_command() -> Vec<String> {
    Vec::new()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn shutdown_command() -> Vec<String> {
    Vec::new()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn alert_command() -> Vec<String> {
    Vec::new()
}

/// Desktop notifications through the platform's notification tool.
pub struct CommandNotifier;

impl CommandNotifier {
    /// On Linux a notification daemon is only reachable inside a graphical
    /// session.
    pub fn detect() -> Option<Self> {
        if !cfg!(target_os = "linux") {
            return Some(Self);
        }
        let graphical = std::env::var_os("DISPLAY").is_some()
            || std::env::var_os("WAYLAND_DISPLAY").is_some();
        graphical.then_some(Self)
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<()> {
        exec::run_checked(&notify_command(title, message), EFFECT_TIMEOUT).map(|_| ())
    }
}

#[cfg(target_os = "macos")]
fn notify_command(title: &str, message: &str) -> Vec<String> {
    let escape = |text: &str| text.replace('\\', "\\\\").replace('"', "\\\"");
    vec![
        "osascript".to_string(),
        "-e".to_string(),
        format!(
            "display notification \"{}\" with title \"{}\"",
            escape(message),
            escape(title)
        ),
    ]
}

#[cfg(windows)]
fn notify_command(title: &str, message: &str) -> Vec<String> {
    vec![
        "msg".to_string(),
        "*".to_string(),
        "/TIME:30".to_string(),
        format!("{}: {}", title, message),
    ]
}

#[cfg(not(any(target_os = "macos", windows)))]
fn notify_command(title: &str, message: &str) -> Vec<String> {
    vec![
        "notify-send".to_string(),
        "--urgency=critical".to_string(),
        title.to_string(),
        message.to_string(),
    ]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn touch(path: &std::path::Path) -> Vec<String> {
        vec!["sh".into(), "-c".into(), format!("echo x >> '{}'", path.display())]
    }

    #[test]
    fn toggle_runs_once_until_deactivated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let on = temp_dir.path().join("on");
        let off = temp_dir.path().join("off");
        let capability =
            CommandCapability::new(Effect::Desaturate, touch(&on), Some(touch(&off)), Trigger::Toggle);

        capability.activate().unwrap();
        capability.activate().unwrap();
        capability.deactivate().unwrap();
        capability.deactivate().unwrap();

        assert_eq!(fs_err::read_to_string(&on).unwrap().lines().count(), 1);
        assert_eq!(fs_err::read_to_string(&off).unwrap().lines().count(), 1);
    }

    #[test]
    fn every_time_repeats() {
        let temp_dir = tempfile::tempdir().unwrap();
        let on = temp_dir.path().join("lock");
        let capability = CommandCapability::new(Effect::ForceLock, touch(&on), None, Trigger::EveryTime);
        for _ in 0..3 {
            capability.activate().unwrap();
        }
        capability.deactivate().unwrap();
        assert_eq!(fs_err::read_to_string(&on).unwrap().lines().count(), 3);
    }

    #[test]
    fn failed_command_is_effector_failure() {
        let capability =
            CommandCapability::new(Effect::Desaturate, vec!["false".into()], None, Trigger::Toggle);
        assert!(matches!(
            capability.activate(),
            Err(WardenError::EffectorFailed { .. })
        ));
        // A failed activation leaves the effect off, so the next attempt runs again.
        assert!(capability.activate().is_err());
    }
}
