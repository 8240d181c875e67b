use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Local};
use fs_err as fs;
use tracing::warn;
use warden_protocol::{
    parse_command, parse_config, parse_status, AgentConfig, CommandRecord, StatusRecord,
};

use super::lease::FileLease;
use super::write_atomic;
use crate::config::Paths;
use crate::error::{Result, WardenError};
use crate::rules::MonitoringWindow;

/// The four well-known files shared by the agent, the watchdogs and the UI.
#[derive(Debug, Clone)]
pub struct CoordinationStore {
    paths: Paths,
}

impl CoordinationStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(self.paths.root()).map_err(|err| {
            WardenError::io(
                format!("Failed to create {}", self.paths.root().display()),
                err,
            )
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // config.json
    // ─────────────────────────────────────────────────────────────────────

    pub fn load_config(&self) -> Result<AgentConfig> {
        let path = self.paths.config();
        let bytes = read_existing(&path)?;
        parse_config(&bytes).map_err(|info| WardenError::ConfigMalformed {
            path,
            details: info.to_string(),
        })
    }

    pub fn write_config(&self, config: &AgentConfig) -> Result<()> {
        let payload = serde_json::to_vec_pretty(config).map_err(|e| WardenError::Json {
            context: "Failed to serialize config".to_string(),
            source: e,
        })?;
        write_atomic(&self.paths.config(), &payload)
    }

    pub fn lease_config(&self) -> Result<FileLease> {
        FileLease::acquire(&self.paths.config())
    }

    pub fn config_is_leased(&self) -> bool {
        FileLease::is_held_elsewhere(&self.paths.config())
    }

    /// Ends the configured window at `now` so neither the guard nor a
    /// relaunched agent monitors again. A start later than `now` is pulled
    /// back to keep the window well formed. Returns `false` when there is no
    /// config to close.
    pub fn close_window(&self, now: DateTime<Local>) -> Result<bool> {
        let mut config = match self.load_config() {
            Ok(config) => config,
            Err(WardenError::FileNotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        config.end_time = Some(now);
        if config.start_time.map_or(false, |start| start > now) {
            config.start_time = Some(now);
        }
        self.write_config(&config)?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // status.json
    // ─────────────────────────────────────────────────────────────────────

    /// Replaces status in one rename so readers never observe a missing file.
    pub fn write_status(&self, points: u32, level: u8) -> Result<()> {
        let record = StatusRecord {
            points,
            level,
            last_updated: Local::now(),
        };
        let payload = serde_json::to_vec(&record).map_err(|e| WardenError::Json {
            context: "Failed to serialize status".to_string(),
            source: e,
        })?;
        write_atomic(&self.paths.status(), &payload)
    }

    pub fn read_status(&self) -> Result<StatusRecord> {
        let path = self.paths.status();
        let bytes = read_existing(&path)?;
        parse_status(&bytes).map_err(|info| WardenError::ConfigMalformed {
            path,
            details: info.to_string(),
        })
    }

    /// Points carried over from a previous run of the same session.
    ///
    /// Status written before the session started belongs to an older session
    /// and is ignored.
    pub fn resume_points(&self, window: Option<&MonitoringWindow>) -> u32 {
        let status = match self.read_status() {
            Ok(status) => status,
            Err(WardenError::FileNotFound(_)) => return 0,
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable status on resume");
                return 0;
            }
        };
        match window {
            Some(window) if status.last_updated >= window.start => status.points,
            _ => 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // command.json
    // ─────────────────────────────────────────────────────────────────────

    /// Takes ownership of the pending command, if any.
    ///
    /// The file is renamed aside, read, and deleted before anything is applied,
    /// so a crash at any point after the rename loses the command rather than
    /// applying it twice.
    pub fn claim_command(&self) -> Result<Option<CommandRecord>> {
        let pending = self.paths.command();
        let claimed = self.paths.claimed_command();

        match fs::rename(&pending, &claimed) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(WardenError::io("Failed to claim command", err)),
        }

        let bytes = fs::read(&claimed);
        if let Err(err) = fs::remove_file(&claimed) {
            warn!(error = %err, "Failed to delete claimed command");
        }
        let bytes = bytes.map_err(|err| WardenError::io("Failed to read claimed command", err))?;

        match parse_command(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(info) => {
                warn!(code = %info.code, message = %info.message, "Dropping malformed command");
                Ok(None)
            }
        }
    }

    /// Deletes a claimed command left behind by a crash. Returns true if one was found.
    pub fn discard_stale_claims(&self) -> bool {
        let claimed = self.paths.claimed_command();
        match fs::remove_file(&claimed) {
            Ok(()) => {
                warn!(path = %claimed.display(), "Discarded command claimed by a previous run");
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(error = %err, "Failed to discard stale command claim");
                false
            }
        }
    }

    pub fn post_command(&self, record: &CommandRecord) -> Result<()> {
        let payload = serde_json::to_vec(record).map_err(|e| WardenError::Json {
            context: "Failed to serialize command".to_string(),
            source: e,
        })?;
        write_atomic(&self.paths.command(), &payload)
    }

    pub fn has_pending_command(&self) -> bool {
        self.paths.command().exists()
    }

    // ─────────────────────────────────────────────────────────────────────
    // agent_log.txt
    // ─────────────────────────────────────────────────────────────────────

    pub fn append_log(&self, line: &str) -> Result<()> {
        let path = self.paths.log();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| WardenError::io("Failed to open audit log", err))?;
        writeln!(file, "{}", line.trim_end())
            .map_err(|err| WardenError::io("Failed to append audit log", err))
    }

    /// Appends `[HH:MM:SS] message`.
    pub fn audit(&self, message: &str) -> Result<()> {
        self.append_log(&format!("[{}] {}", Local::now().format("%H:%M:%S"), message))
    }

    /// Returns at most `max_bytes` from the end of the log, starting at a line boundary.
    pub fn tail_log(&self, max_bytes: u64) -> Result<String> {
        let path = self.paths.log();
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => return Err(WardenError::io("Failed to open audit log", err)),
        };
        let len = file
            .metadata()
            .map_err(|err| WardenError::io("Failed to stat audit log", err))?
            .len();

        let truncated = len > max_bytes;
        if truncated {
            file.seek(SeekFrom::Start(len - max_bytes))
                .map_err(|err| WardenError::io("Failed to seek audit log", err))?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| WardenError::io("Failed to read audit log", err))?;

        let start = if truncated {
            buf.iter()
                .position(|b| *b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(buf.len())
        } else {
            0
        };
        Ok(String::from_utf8_lossy(&buf[start..]).into_owned())
    }

    /// Clears status and log ahead of a new session.
    pub fn reset_session_files(&self) -> Result<()> {
        for path in [self.paths.status(), self.paths.log()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(WardenError::io(
                        format!("Failed to remove {}", path.display()),
                        err,
                    ))
                }
            }
        }
        Ok(())
    }
}

fn read_existing(path: &std::path::Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(WardenError::FileNotFound(path.to_path_buf()))
        }
        Err(err) => Err(WardenError::io(
            format!("Failed to read {}", path.display()),
            err,
        )),
    }
}
