//! warden: supervision tiers and session control.
//!
//! ## Subcommands
//!
//! - `guard`: tier 2, keeps the agent running exactly inside the window
//! - `sentinel`: tier 3, keeps the guard registered
//! - `configure`, `status`, `log`, `add-points`, `stop`: session control
//!   through the coordination files

mod session;
mod watchdog;

use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use warden_core::{load_tuning_or_default, logging, CoordinationStore, Paths, StopSignal};
use warden_protocol::LOG_TAIL_BYTES;

use crate::session::SessionRequest;

const STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Screen accountability: supervision and session control")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the guard loop (tier 2, installed as a system service)
    Guard,

    /// Run the sentinel loop (tier 3, installed as a system service)
    Sentinel,

    /// Start a new session
    Configure {
        /// What you intend to work on
        #[arg(long)]
        goal: String,

        /// What counts as a violation
        #[arg(long, default_value = "")]
        prohibited: String,

        /// Session length in minutes, starting now
        #[arg(long)]
        minutes: i64,

        /// Judge model name
        #[arg(long)]
        model: Option<String>,

        /// Ask the judge over HTTP instead of the local CLI
        #[arg(long, value_name = "BOOL")]
        use_api: Option<bool>,

        /// Credential for API mode
        #[arg(long)]
        api_key: Option<String>,

        /// Path to the judge CLI
        #[arg(long)]
        cli_path: Option<String>,

        /// Path to the judge's session-protocol script
        #[arg(long)]
        acp_script: Option<String>,
    },

    /// Show points and level
    Status,

    /// Print the end of the agent log
    Log {
        /// Maximum bytes to print
        #[arg(long, default_value_t = LOG_TAIL_BYTES)]
        bytes: u64,
    },

    /// Adjust points by a signed amount
    AddPoints {
        #[arg(value_name = "POINTS", allow_hyphen_values = true)]
        value: i64,
    },

    /// End the running session
    Stop,
}

fn main() {
    let cli = Cli::parse();

    let paths = match Paths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            tracing::error!(error = %err, "Failed to resolve monitoring directory");
            std::process::exit(1);
        }
    };
    let store = CoordinationStore::new(paths.clone());

    match cli.command {
        Commands::Guard => {
            let _logging_guard = logging::init(Some(&paths.logs()), "guard.log", "info");
            run_tier(&paths, watchdog::run_guard);
        }
        Commands::Sentinel => {
            let _logging_guard = logging::init(Some(&paths.logs()), "sentinel.log", "info");
            run_tier(&paths, watchdog::run_sentinel);
        }
        Commands::Configure {
            goal,
            prohibited,
            minutes,
            model,
            use_api,
            api_key,
            cli_path,
            acp_script,
        } => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            let request = SessionRequest {
                goal,
                prohibited,
                minutes,
                model,
                use_api,
                api_key,
                cli_path,
                acp_script,
            };
            match session::configure(&store, &request, Local::now()) {
                Ok(config) => {
                    if let (Some(start), Some(end)) = (config.start_time, config.end_time) {
                        println!(
                            "Session configured: {} - {}",
                            start.format("%H:%M"),
                            end.format("%H:%M")
                        );
                    }
                }
                Err(e) => fail("configure", &e),
            }
        }
        Commands::Status => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            match session::status(&store) {
                Some(status) => println!(
                    "Points: {}\nLevel: {}\nLast updated: {}",
                    status.points,
                    status.level,
                    status.last_updated.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("No status yet"),
            }
        }
        Commands::Log { bytes } => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            match store.tail_log(bytes) {
                Ok(text) => print!("{}", text),
                Err(e) => fail("log", &e.to_string()),
            }
        }
        Commands::AddPoints { value } => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            if let Err(e) = session::add_points(&store, value) {
                fail("add-points", &e);
            }
        }
        Commands::Stop => {
            let _logging_guard = logging::init(None, "warden.log", "warn");
            match session::stop(&store, STOP_WAIT, Local::now()) {
                Ok(true) => println!("Session stopped"),
                Ok(false) => println!("Stop requested; the agent has not exited yet"),
                Err(e) => fail("stop", &e),
            }
        }
    }
}

fn run_tier(
    paths: &Paths,
    tier: fn(&Paths, &warden_core::tuning::SupervisionTuning, std::path::PathBuf, &StopSignal),
) {
    let current_exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            tracing::error!(error = %err, "Failed to resolve own executable");
            std::process::exit(1);
        }
    };
    let tuning = load_tuning_or_default(&paths.tuning());
    let stop = StopSignal::new();
    tier(paths, &tuning.supervision, current_exe, &stop);
}

fn fail(command: &str, message: &str) -> ! {
    tracing::error!(error = %message, "warden {} failed", command);
    eprintln!("Error: {}", message);
    std::process::exit(1);
}
