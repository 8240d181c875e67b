//! Warden agent entrypoint.
//!
//! Tier 1 of the supervision chain: a no-argument process started inside
//! the user's desktop session by the guard. It captures the screen on a
//! fixed cycle, asks the judge, and escalates interventions until the
//! monitoring window ends or a stop command arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};
use warden_core::logging;
use warden_core::{
    apply_startup_backoff, load_tuning_or_default, BackoffPolicy, CoordinationStore, Paths,
    StopSignal,
};

mod commands;
mod panic_report;
mod runtime;

const LOG_FILE: &str = "agent.log";
static TERMINATE: AtomicBool = AtomicBool::new(false);
const TERMINATE_POLL: Duration = Duration::from_millis(250);

fn main() {
    let paths = match Paths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            let _logging_guard = logging::init(None, LOG_FILE, "info");
            error!(error = %err, "Failed to resolve monitoring directory");
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(Some(&paths.logs()), LOG_FILE, "info");
    let store = CoordinationStore::new(paths.clone());
    panic_report::install_panic_hook(Some(store.clone()));

    if let Err(err) = store.ensure_dir() {
        error!(error = %err, path = %paths.root().display(), "Failed to prepare monitoring directory");
        std::process::exit(1);
    }
    apply_startup_backoff(&paths.backoff(), BackoffPolicy::default());

    let tuning = load_tuning_or_default(&paths.tuning());
    let stop = StopSignal::new();
    install_termination_handler(stop.clone());

    info!(root = %paths.root().display(), "Warden agent started");
    if let Err(err) = runtime::run(store, tuning, stop) {
        error!(error = %err, "Agent session failed");
        std::process::exit(1);
    }
    info!("Warden agent exiting");
}

/// Turns SIGTERM/SIGINT into a graceful session end so effects are reverted.
fn install_termination_handler(stop: StopSignal) {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
    }

    let spawned = thread::Builder::new()
        .name("termination".to_string())
        .spawn(move || loop {
            if TERMINATE.load(Ordering::SeqCst) {
                warn!("Termination requested");
                stop.stop();
                break;
            }
            if stop.wait(TERMINATE_POLL) {
                break;
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to start termination watcher");
    }
}

#[cfg(unix)]
extern "C" fn on_terminate(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}
