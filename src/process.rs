use std::path::Path;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessStatus, System};
use tracing::debug;

/// Linux truncates `comm` to this many bytes.
const COMM_LIMIT: usize = 15;

/// OS process enumeration and termination, keyed by executable name.
pub trait ProcessTable: Send + Sync {
    fn find(&self, names: &[String]) -> Vec<u32>;
    fn kill(&self, pid: u32) -> bool;
}

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

impl ProcessTable for SysinfoProcessTable {
    fn find(&self, names: &[String]) -> Vec<u32> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes();
        let own_pid = std::process::id();
        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| {
                let exe_name = process
                    .exe()
                    .and_then(Path::file_name)
                    .map(|name| name.to_string_lossy().to_string());
                names.iter().any(|wanted| {
                    matches_process_name(process.name(), wanted)
                        || exe_name
                            .as_deref()
                            .map(|exe| exe.eq_ignore_ascii_case(wanted))
                            .unwrap_or(false)
                })
            })
            .map(|(pid, _)| pid.as_u32())
            .filter(|pid| *pid != own_pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn kill(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        system.refresh_processes();
        let killed = system
            .process(Pid::from_u32(pid))
            .map(|process| process.kill())
            .unwrap_or(false);
        debug!(pid, killed, "kill requested");
        killed
    }
}

pub fn matches_process_name(candidate: &str, wanted: &str) -> bool {
    if candidate.eq_ignore_ascii_case(wanted) {
        return true;
    }
    candidate.len() == COMM_LIMIT
        && wanted.len() > COMM_LIMIT
        && wanted
            .get(..COMM_LIMIT)
            .map(|prefix| prefix.eq_ignore_ascii_case(candidate))
            .unwrap_or(false)
}
