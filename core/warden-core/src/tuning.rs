//! Operator tuning loaded from `warden.toml` in the monitoring directory.
//!
//! The file is optional. Every section and key falls back to the defaults
//! below, so an empty file and a missing file behave the same.
//!
//! ```toml
//! [scoring]
//! violation_points = 15
//! compliance_points = 5
//! level_width = 45
//! max_level = 7
//!
//! [effectors.desaturate]
//! activate = ["gsettings", "set", "org.gnome.desktop.a11y.magnifier", "color-saturation", "0.0"]
//! deactivate = ["gsettings", "set", "org.gnome.desktop.a11y.magnifier", "color-saturation", "1.0"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Tuning {
    pub scoring: ScoringTuning,
    pub cycle: CycleTuning,
    pub analysis: AnalysisTuning,
    pub terminal: TerminalTuning,
    pub capture: CaptureTuning,
    pub effectors: BTreeMap<String, CommandSpec>,
    pub pointer: PointerTuning,
    pub supervision: SupervisionTuning,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringTuning {
    pub violation_points: u32,
    pub compliance_points: u32,
    pub level_width: u32,
    pub max_level: u8,
}

impl Default for ScoringTuning {
    fn default() -> Self {
        Self {
            violation_points: 15,
            compliance_points: 5,
            level_width: 45,
            max_level: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleTuning {
    pub tick_secs: u64,
    pub min_first_wait_secs: u64,
    pub command_poll_secs: u64,
    pub command_debounce_ms: u64,
}

impl Default for CycleTuning {
    fn default() -> Self {
        Self {
            tick_secs: 20,
            min_first_wait_secs: 1,
            command_poll_secs: 5,
            command_debounce_ms: 200,
        }
    }
}

impl CycleTuning {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(2))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisTuning {
    pub cli_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub verdict_timeout_secs: u64,
    pub node_path: String,
    pub api_base: String,
    pub session_retry_secs: u64,
}

impl Default for AnalysisTuning {
    fn default() -> Self {
        Self {
            cli_timeout_secs: 90,
            rpc_timeout_secs: 120,
            verdict_timeout_secs: 30,
            node_path: "node".to_string(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            session_retry_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalTuning {
    pub lock_grace_secs: u64,
    pub lock_hold_secs: u64,
    pub lock_repeat_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TerminalTuning {
    fn default() -> Self {
        Self {
            lock_grace_secs: 3,
            lock_hold_secs: 3,
            lock_repeat_ms: 500,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureTuning {
    /// Argv template; `{path}` is the output file, `{output}` the monitor name.
    pub command: Option<Vec<String>>,
    /// Monitor names to capture one by one. Empty means one full-desktop capture.
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSpec {
    pub activate: Option<Vec<String>>,
    pub deactivate: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PointerTuning {
    pub interval_ms: u64,
    pub gain: f64,
}

impl Default for PointerTuning {
    fn default() -> Self {
        Self {
            interval_ms: 16,
            gain: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisionTuning {
    pub interval_secs: u64,
    pub terminate_attempts: u32,
    pub terminate_pause_ms: u64,
    pub agent_unit: String,
    pub guard_unit: String,
    pub sentinel_unit: String,
    pub agent_process: String,
    pub agent_exe: Option<PathBuf>,
    pub guard_exe: Option<PathBuf>,
    /// Interactive user whose session receives the agent launch handoff.
    pub session_user: Option<String>,
}

impl Default for SupervisionTuning {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            terminate_attempts: 5,
            terminate_pause_ms: 500,
            agent_unit: "warden-agent".to_string(),
            guard_unit: "warden-guard".to_string(),
            sentinel_unit: "warden-sentinel".to_string(),
            agent_process: "warden-agent".to_string(),
            agent_exe: None,
            guard_exe: None,
            session_user: None,
        }
    }
}

impl SupervisionTuning {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(1, 5))
    }
}

pub fn load_tuning(path: &Path) -> Result<Tuning, String> {
    if !path.exists() {
        return Ok(Tuning::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read tuning {}: {}", path.display(), err))?;
    toml::from_str::<Tuning>(&content)
        .map_err(|err| format!("Failed to parse tuning {}: {}", path.display(), err))
}

/// Loads tuning, logging and falling back to defaults on any failure.
pub fn load_tuning_or_default(path: &Path) -> Tuning {
    match load_tuning(path) {
        Ok(tuning) => tuning,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load tuning; using defaults");
            Tuning::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let tuning = load_tuning(&temp_dir.path().join("missing.toml")).expect("load");
        assert_eq!(tuning.scoring.violation_points, 15);
        assert_eq!(tuning.scoring.level_width, 45);
        assert_eq!(tuning.analysis.cli_timeout_secs, 90);
        assert_eq!(tuning.supervision.interval(), Duration::from_secs(5));
    }

    #[test]
    fn parses_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("warden.toml");
        fs_err::write(
            &path,
            r#"
[scoring]
violation_points = 30
level_width = 100

[effectors.desaturate]
activate = ["gray", "on"]

[supervision]
interval_secs = 60
"#,
        )
        .expect("write tuning");

        let tuning = load_tuning(&path).expect("load");
        assert_eq!(tuning.scoring.violation_points, 30);
        assert_eq!(tuning.scoring.compliance_points, 5);
        assert_eq!(tuning.scoring.level_width, 100);
        let spec = tuning.effectors.get("desaturate").expect("desaturate");
        assert_eq!(spec.activate.as_deref(), Some(&["gray".to_string(), "on".to_string()][..]));
        assert!(spec.deactivate.is_none());
        // The watchdog interval never exceeds five seconds.
        assert_eq!(tuning.supervision.interval(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_file_falls_back() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("warden.toml");
        fs_err::write(&path, "[scoring\nviolation_points = ").expect("write");
        assert!(load_tuning(&path).is_err());
        assert_eq!(load_tuning_or_default(&path).scoring.max_level, 7);
    }
}
