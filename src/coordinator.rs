//! Cross-process instance coordination.
//!
//! The first launcher to take the system-wide singleton becomes Master and
//! owns the managed application's lifecycle; later ones are Slaves. Role
//! changes are broadcast to subscribers over channels.

use crate::cancel::CancelToken;
use crate::config::ensure_parent;
use crate::error::LaunchError;
use crate::process::ProcessTable;
use fd_lock::RwLock;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    None,
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoleChange {
    pub previous: InstanceRole,
    pub current: InstanceRole,
}

/// A named, system-wide mutual exclusion primitive.
pub trait SystemSingleton: Send {
    /// `Master` when this process now owns the singleton, `Slave` when another
    /// process does. A Slave attempt keeps no handle open.
    fn try_acquire(&mut self) -> Result<InstanceRole, LaunchError>;
    /// Returns `false` when nothing was held.
    fn release(&mut self) -> bool;
    fn is_held(&self) -> bool;
}

struct LockHolder {
    release: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Exclusive advisory lock on a file. The lock guard borrows the file, so a
/// dedicated thread owns both and parks until release is requested. The OS
/// drops the lock if the process dies.
pub struct FileLockSingleton {
    path: PathBuf,
    holder: Option<LockHolder>,
}

impl FileLockSingleton {
    pub fn new(path: PathBuf) -> Self {
        Self { path, holder: None }
    }
}

fn is_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    // ERROR_LOCK_VIOLATION
    cfg!(windows) && err.raw_os_error() == Some(33)
}

impl SystemSingleton for FileLockSingleton {
    fn try_acquire(&mut self) -> Result<InstanceRole, LaunchError> {
        if self.holder.is_some() {
            return Ok(InstanceRole::Master);
        }
        ensure_parent(&self.path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<bool>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("singleton-holder".to_string())
            .spawn(move || {
                let mut lock = RwLock::new(file);
                let mut guard = match lock.try_write() {
                    Ok(guard) => guard,
                    Err(err) if is_contention(&err) => {
                        let _ = ready_tx.send(Ok(false));
                        return;
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = guard
                    .set_len(0)
                    .and_then(|_| guard.write_all(std::process::id().to_string().as_bytes()));
                let _ = ready_tx.send(Ok(true));
                let _ = release_rx.recv();
            })?;

        let acquired = ready_rx
            .recv()
            .map_err(|_| LaunchError::Process("singleton holder exited unexpectedly".to_string()))??;
        if acquired {
            self.holder = Some(LockHolder {
                release: release_tx,
                thread,
            });
            Ok(InstanceRole::Master)
        } else {
            let _ = thread.join();
            Ok(InstanceRole::Slave)
        }
    }

    fn release(&mut self) -> bool {
        let Some(holder) = self.holder.take() else {
            return false;
        };
        let _ = holder.release.send(());
        let _ = holder.thread.join();
        true
    }

    fn is_held(&self) -> bool {
        self.holder.is_some()
    }
}

impl Drop for FileLockSingleton {
    fn drop(&mut self) {
        self.release();
    }
}

/// PID recorded by the current singleton owner, if readable.
pub fn recorded_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

struct CoordinatorState {
    role: InstanceRole,
    singleton: Box<dyn SystemSingleton>,
}

pub struct InstanceCoordinator {
    state: Mutex<CoordinatorState>,
    subscribers: Mutex<Vec<mpsc::Sender<RoleChange>>>,
    processes: Arc<dyn ProcessTable>,
    managed: Vec<String>,
    poll_interval: Duration,
}

impl InstanceCoordinator {
    pub fn new(
        singleton: Box<dyn SystemSingleton>,
        processes: Arc<dyn ProcessTable>,
        managed: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                role: InstanceRole::None,
                singleton,
            }),
            subscribers: Mutex::new(Vec::new()),
            processes,
            managed,
            poll_interval,
        }
    }

    pub fn role(&self) -> InstanceRole {
        self.state
            .lock()
            .map(|state| state.role)
            .unwrap_or(InstanceRole::None)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<RoleChange> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Returns `true` only when this process is (or already was) Master.
    pub fn capture_singleton(&self) -> Result<bool, LaunchError> {
        let change = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| LaunchError::Process("coordinator lock poisoned".to_string()))?;
            if state.role == InstanceRole::Master && state.singleton.is_held() {
                return Ok(true);
            }
            let acquired = state.singleton.try_acquire()?;
            let previous = state.role;
            state.role = acquired;
            RoleChange {
                previous,
                current: acquired,
            }
        };

        if change.current == InstanceRole::Master {
            info!("singleton captured; this instance is master");
            let terminated = self.terminate_managed_processes();
            if terminated > 0 {
                info!(terminated, "terminated stale managed processes");
            }
        } else {
            info!("singleton held elsewhere; this instance is a slave");
        }
        self.broadcast(change);
        Ok(change.current == InstanceRole::Master)
    }

    pub fn release_singleton(&self) -> bool {
        let change = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if !state.singleton.is_held() {
                return false;
            }
            state.singleton.release();
            let previous = state.role;
            state.role = InstanceRole::None;
            RoleChange {
                previous,
                current: InstanceRole::None,
            }
        };
        info!("singleton released");
        self.broadcast(change);
        true
    }

    pub fn running_managed_processes(&self) -> Vec<u32> {
        self.processes.find(&self.managed)
    }

    fn terminate_managed_processes(&self) -> usize {
        self.running_managed_processes()
            .into_iter()
            .filter(|pid| {
                let killed = self.processes.kill(*pid);
                if !killed {
                    warn!(pid, "failed to terminate managed process");
                }
                killed
            })
            .count()
    }

    /// Polls the process table until no managed process remains, the timeout
    /// elapses, this instance stops being Master, or `cancel` fires. Returns
    /// whether every managed process exited.
    pub fn wait_for_all_managed_processes_to_exit(&self, timeout: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let running = self.running_managed_processes();
            if running.is_empty() {
                return true;
            }
            if self.role() != InstanceRole::Master {
                debug!("no longer master; stopping exit wait");
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    remaining = running.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "managed processes still running after timeout"
                );
                return false;
            }
            if !cancel.sleep(self.poll_interval.min(deadline - now)) {
                return false;
            }
        }
    }

    fn broadcast(&self, change: RoleChange) {
        if change.previous == change.current {
            return;
        }
        debug!(previous = ?change.previous, current = ?change.current, "role changed");
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(change).is_ok());
        }
    }
}
