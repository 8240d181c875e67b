//! Startup backoff for a supervised process that keeps crashing.
//!
//! Each start is recorded in a small JSON file. More than `max_starts`
//! starts inside `window` delays the next start by `step` per extra start,
//! capped at `max`, so a crash loop under the guard does not hammer the
//! judge or flicker effectors.

use std::cmp;
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub window_secs: i64,
    pub max_starts: usize,
    pub step_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            window_secs: 120,
            max_starts: 3,
            step_secs: 10,
            max_secs: 60,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StartHistory {
    starts: Vec<DateTime<Utc>>,
}

/// Records this start and sleeps if the process is restarting too often.
/// Returns the delay that was applied.
pub fn apply_startup_backoff(path: &Path, policy: BackoffPolicy) -> Option<Duration> {
    let mut history = load_history(path).unwrap_or_else(|err| {
        warn!(error = %err, "Discarding unreadable start history");
        StartHistory::default()
    });
    let delay = record_start(Utc::now(), &mut history, policy);

    if let Err(err) = save_history(path, &history) {
        warn!(error = %err, "Failed to persist start history");
    }

    if let Some(delay) = delay {
        warn!(
            count = history.starts.len(),
            backoff_secs = delay.as_secs(),
            "Startup backoff engaged"
        );
        thread::sleep(delay);
    }
    delay
}

fn record_start(
    now: DateTime<Utc>,
    history: &mut StartHistory,
    policy: BackoffPolicy,
) -> Option<Duration> {
    history
        .starts
        .retain(|start| now.signed_duration_since(*start).num_seconds() <= policy.window_secs);
    history.starts.push(now);

    let extra = history.starts.len().checked_sub(policy.max_starts)?;
    if extra == 0 {
        return None;
    }
    let secs = policy.step_secs.saturating_mul(extra as u64);
    Some(Duration::from_secs(cmp::min(secs, policy.max_secs)))
}

fn load_history(path: &Path) -> Result<StartHistory, String> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StartHistory::default())
        }
        Err(err) => return Err(format!("Failed to read start history: {}", err)),
    };
    serde_json::from_slice(&data).map_err(|err| format!("Failed to parse start history: {}", err))
}

fn save_history(path: &Path, history: &StartHistory) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create start history dir: {}", err))?;
    }
    let payload = serde_json::to_vec(history)
        .map_err(|err| format!("Failed to serialize start history: {}", err))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| format!("Failed to write start history: {}", err))?;
    fs::rename(&tmp_path, path).map_err(|err| format!("Failed to commit start history: {}", err))
}
