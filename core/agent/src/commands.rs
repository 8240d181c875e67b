//! Command worker: watches for `command.json` and applies it at most once.
//!
//! Filesystem events wake the worker early; a slow poll covers platforms
//! and filesystems where events are lost.

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use warden_core::tuning::CycleTuning;
use warden_core::ScoreInput;
use warden_protocol::{CommandKind, COMMAND_FILE};

use crate::runtime::Session;

const IDLE_WAIT: Duration = Duration::from_millis(250);

pub fn spawn(session: Arc<Session>, cycle: &CycleTuning) -> std::io::Result<JoinHandle<()>> {
    let poll = Duration::from_secs(cycle.command_poll_secs.max(1));
    let debounce = Duration::from_millis(cycle.command_debounce_ms);
    thread::Builder::new()
        .name("command-worker".to_string())
        .spawn(move || worker(&session, poll, debounce))
}

fn worker(session: &Session, poll: Duration, debounce: Duration) {
    let (tx, rx) = mpsc::channel::<()>();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|path| is_command_file(path));
            if relevant {
                let _ = tx.send(());
            }
        }
    });
    let _watcher = match watcher {
        Ok(mut watcher) => {
            let root = session.store().paths().root().to_path_buf();
            match watcher.watch(&root, RecursiveMode::NonRecursive) {
                Ok(()) => Some(watcher),
                Err(err) => {
                    warn!(error = %err, "Command watcher unavailable; polling only");
                    None
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "Command watcher unavailable; polling only");
            None
        }
    };

    let stop = session.stop_signal();
    // A command posted before startup is picked up straight away.
    process_pending(session);
    let mut last_poll = Instant::now();

    while !stop.is_stopped() {
        match rx.recv_timeout(IDLE_WAIT) {
            Ok(()) => {
                // Let the writer finish its rename before claiming.
                if stop.wait(debounce) {
                    break;
                }
                while rx.try_recv().is_ok() {}
                process_pending(session);
                last_poll = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_poll.elapsed() >= poll {
                    process_pending(session);
                    last_poll = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if stop.wait(IDLE_WAIT) {
                    break;
                }
                if last_poll.elapsed() >= poll {
                    process_pending(session);
                    last_poll = Instant::now();
                }
            }
        }
    }
    debug!("Command worker stopped");
}

fn is_command_file(path: &Path) -> bool {
    path.file_name().map(|name| name == COMMAND_FILE).unwrap_or(false)
}

/// Claims and applies the pending command, if any.
pub fn process_pending(session: &Session) -> bool {
    let record = match session.store().claim_command() {
        Ok(Some(record)) => record,
        Ok(None) => return false,
        Err(err) => {
            warn!(error = %err, "Failed to claim command");
            return false;
        }
    };

    match record.command {
        CommandKind::AddPoints => {
            info!(delta = record.value, "Applying point adjustment");
            session.audit(&format!("Command: add {} points", record.value));
            session.apply(ScoreInput::Delta(record.value));
        }
        CommandKind::Stop => {
            info!("Stop requested");
            session.audit("Command: stop");
            session.stop_signal().stop();
        }
    }
    true
}
