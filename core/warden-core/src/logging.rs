//! Diagnostics shared by every warden process: stderr plus an optional
//! daily-rolling file under the monitoring directory.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Forces debug output regardless of `RUST_LOG`.
pub const DEBUG_ENV: &str = "WARDEN_DEBUG_LOG";

/// Installs the global subscriber. `file_prefix` names the daily log file;
/// without `log_dir` output goes to stderr only.
///
/// Keep the guard alive for the whole process or buffered file output is
/// lost.
pub fn init(log_dir: Option<&Path>, file_prefix: &str, default_level: &str) -> Option<WorkerGuard> {
    let debug = env::var(DEBUG_ENV)
        .map(|value| debug_requested(&value))
        .unwrap_or(false);
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file = log_dir.and_then(|dir| {
        fs_err::create_dir_all(dir).ok()?;
        let appender = tracing_appender::rolling::daily(dir, file_prefix);
        Some(tracing_appender::non_blocking(appender))
    });

    match file {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn debug_requested(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "YES")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_accepts_common_spellings() {
        for value in ["1", "true", "TRUE", "yes", "YES", " 1\n"] {
            assert!(debug_requested(value), "{:?}", value);
        }
        for value in ["", "0", "false", "no", "debug"] {
            assert!(!debug_requested(value), "{:?}", value);
        }
    }
}
