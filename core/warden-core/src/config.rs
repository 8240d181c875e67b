//! Path resolution for the monitoring directory.
//!
//! Every tier resolves the same directory: `$WARDEN_HOME` when set (service
//! registrations pass it explicitly), otherwise `<data dir>/warden`.

use std::env;
use std::path::{Path, PathBuf};

use warden_protocol::{CLAIMED_SUFFIX, COMMAND_FILE, CONFIG_FILE, LOG_FILE, STATUS_FILE};

use crate::error::{Result, WardenError};

pub const HOME_ENV: &str = "WARDEN_HOME";
pub const TUNING_FILE: &str = "warden.toml";
pub const BACKOFF_FILE: &str = "agent-backoff.json";
pub const CAPTURE_DIR: &str = "captures";
pub const LOG_DIR: &str = "logs";

/// Returns the monitoring directory without creating it.
pub fn monitoring_dir() -> Result<PathBuf> {
    if let Ok(value) = env::var(HOME_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("warden"))
        .ok_or(WardenError::NoMonitoringDir)
}

/// Well-known paths inside one monitoring directory.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve() -> Result<Self> {
        monitoring_dir().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn status(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn command(&self) -> PathBuf {
        self.root.join(COMMAND_FILE)
    }

    /// Where a command sits between being claimed and being deleted.
    pub fn claimed_command(&self) -> PathBuf {
        self.root.join(format!("{}.{}", COMMAND_FILE, CLAIMED_SUFFIX))
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn tuning(&self) -> PathBuf {
        self.root.join(TUNING_FILE)
    }

    pub fn backoff(&self) -> PathBuf {
        self.root.join(BACKOFF_FILE)
    }

    pub fn captures(&self) -> PathBuf {
        self.root.join(CAPTURE_DIR)
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }
}
