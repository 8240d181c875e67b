use std::sync::Mutex;

use sysinfo::{Pid, Signal, System};
use tracing::debug;

use super::ProcessTable;

/// Process lookup and termination through `sysinfo`.
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Names as the platform reports them: Windows keeps the `.exe` suffix.
fn candidate_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        names.push(format!("{}.exe", name));
    }
    names
}

impl ProcessTable for SysinfoProcessTable {
    fn find(&self, name: &str) -> Vec<u32> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes();
        let own = std::process::id();
        let mut pids: Vec<u32> = candidate_names(name)
            .iter()
            .flat_map(|candidate| {
                system
                    .processes_by_exact_name(candidate)
                    .map(|process| process.pid().as_u32())
                    .collect::<Vec<_>>()
            })
            .filter(|pid| *pid != own)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn terminate(&self, pid: u32) -> bool {
        let system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match system.process(Pid::from_u32(pid)) {
            // Term is not available everywhere; fall back to a hard kill.
            Some(process) => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            None => {
                debug!(pid, "Process already gone");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_never_listed() {
        let table = SysinfoProcessTable::new();
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().to_string();
        assert!(!table.find(&name).contains(&std::process::id()));
    }

    #[test]
    fn unknown_name_finds_nothing() {
        let table = SysinfoProcessTable::new();
        assert!(table.find("warden-no-such-process-name").is_empty());
    }
}
