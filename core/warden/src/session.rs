//! Session control through the coordination files: what the desktop UI
//! does, available from the command line.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Local};
use tracing::{debug, info, warn};
use warden_core::{CoordinationStore, RuleSet};
use warden_protocol::{AgentConfig, CommandRecord, StatusRecord};

const LEASE_POLL: Duration = Duration::from_millis(100);

/// Settings for a new session. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub goal: String,
    pub prohibited: String,
    pub minutes: i64,
    pub model: Option<String>,
    pub use_api: Option<bool>,
    pub api_key: Option<String>,
    pub cli_path: Option<String>,
    pub acp_script: Option<String>,
}

/// Writes the config for a session starting at `now`.
///
/// Refuses while an agent holds the config lease: a running session cannot
/// be edited. Status and log of the previous session are cleared.
pub fn configure(
    store: &CoordinationStore,
    request: &SessionRequest,
    now: DateTime<Local>,
) -> Result<AgentConfig, String> {
    if request.minutes <= 0 {
        return Err("Session length must be at least one minute".to_string());
    }
    if request.goal.trim().is_empty() {
        return Err("A goal is required".to_string());
    }
    store.ensure_dir().map_err(|e| e.to_string())?;
    if store.config_is_leased() {
        return Err("A session is running; stop it before reconfiguring".to_string());
    }

    let mut config = store.load_config().unwrap_or_default();
    config.rules = RuleSet::compose(&request.goal, &request.prohibited)
        .text()
        .to_string();
    if let Some(model) = &request.model {
        config.model = model.clone();
    }
    if let Some(use_api) = request.use_api {
        config.use_api = use_api;
    }
    if let Some(key) = &request.api_key {
        config.api_key = key.clone();
    }
    if let Some(path) = &request.cli_path {
        config.cli_path = path.clone();
    }
    if let Some(path) = &request.acp_script {
        config.acp_script_path = path.clone();
    }
    config.start_time = Some(now);
    config.end_time = Some(now + ChronoDuration::minutes(request.minutes));

    config
        .validate()
        .map_err(|info| format!("{} ({})", info.message, info.code))?;
    store.reset_session_files().map_err(|e| e.to_string())?;
    store.write_config(&config).map_err(|e| e.to_string())?;
    info!(minutes = request.minutes, use_api = config.use_api, "Session configured");
    Ok(config)
}

pub fn status(store: &CoordinationStore) -> Option<StatusRecord> {
    match store.read_status() {
        Ok(status) => Some(status),
        Err(err) => {
            debug!(error = %err, "No readable status");
            None
        }
    }
}

pub fn add_points(store: &CoordinationStore, value: i64) -> Result<(), String> {
    store
        .post_command(&CommandRecord::add_points(value))
        .map_err(|e| e.to_string())
}

/// Asks the agent to stop, waits for it to let go of the config, then closes
/// the window so the guard keeps the agent down. Returns whether the lease
/// was released in time.
pub fn stop(
    store: &CoordinationStore,
    wait: Duration,
    now: DateTime<Local>,
) -> Result<bool, String> {
    store.ensure_dir().map_err(|e| e.to_string())?;
    store
        .post_command(&CommandRecord::stop())
        .map_err(|e| e.to_string())?;

    let started = Instant::now();
    while store.config_is_leased() && started.elapsed() < wait {
        thread::sleep(LEASE_POLL);
    }
    let released = !store.config_is_leased();
    if !released {
        warn!("Agent still holds the config; closing the window anyway");
    }

    match store.close_window(now) {
        Ok(true) => {}
        Ok(false) => warn!("No config to close"),
        Err(err) => return Err(err.to_string()),
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_core::Paths;

    fn store(dir: &TempDir) -> CoordinationStore {
        let store = CoordinationStore::new(Paths::new(dir.path()));
        store.ensure_dir().unwrap();
        store
    }

    fn request() -> SessionRequest {
        SessionRequest {
            goal: "Write the report".to_string(),
            prohibited: "Video sites".to_string(),
            minutes: 90,
            ..SessionRequest::default()
        }
    }

    #[test]
    fn configure_writes_window_and_rules() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let now = Local::now();
        let config = configure(&store, &request(), now).unwrap();

        assert_eq!(config.rules, "Goal: Write the report\nProhibited: Video sites");
        assert_eq!(config.start_time, Some(now));
        assert_eq!(config.end_time, Some(now + ChronoDuration::minutes(90)));
        let stored = store.load_config().unwrap();
        assert_eq!(stored.rules, config.rules);
    }

    #[test]
    fn configure_keeps_credentials_unless_given() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = SessionRequest {
            use_api: Some(true),
            api_key: Some("secret".to_string()),
            model: Some("gemini-2.5-pro".to_string()),
            ..request()
        };
        configure(&store, &first, Local::now()).unwrap();
        let second = configure(&store, &request(), Local::now()).unwrap();

        assert!(second.use_api);
        assert_eq!(second.api_key, "secret");
        assert_eq!(second.model, "gemini-2.5-pro");
    }

    #[test]
    fn configure_clears_previous_session_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write_status(90, 2).unwrap();
        store.audit("old session").unwrap();

        configure(&store, &request(), Local::now()).unwrap();
        assert!(store.read_status().is_err());
        assert_eq!(store.tail_log(1024).unwrap(), "");
    }

    #[test]
    fn api_mode_without_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let request = SessionRequest {
            use_api: Some(true),
            ..request()
        };
        let err = configure(&store, &request, Local::now()).unwrap_err();
        assert!(err.contains("missing_api_key"));
        assert!(store.load_config().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn configure_refuses_while_leased() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        configure(&store, &request(), Local::now()).unwrap();
        let _lease = store.lease_config().unwrap();

        let err = configure(&store, &request(), Local::now()).unwrap_err();
        assert!(err.contains("running"));
    }

    #[test]
    fn stop_posts_command_and_closes_window() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let start = Local::now();
        configure(&store, &request(), start).unwrap();

        let now = start + ChronoDuration::minutes(10);
        assert!(stop(&store, Duration::from_millis(50), now).unwrap());
        assert!(store.has_pending_command());
        assert_eq!(store.load_config().unwrap().end_time, Some(now));
    }

    #[test]
    fn add_points_posts_a_command() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        add_points(&store, -20).unwrap();
        let record = store.claim_command().unwrap().unwrap();
        assert_eq!(record.value, -20);
    }
}
