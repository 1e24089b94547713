//! Worker registry: the single source of truth for which models are running.
//!
//! Every entry owns its worker's process handle. Other components reach the
//! process only through registry operations, each of which holds the lock for
//! its whole duration and never across an await point.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::worker::{WorkerId, WorkerSnapshot, WorkerState};
use crate::{plog_debug, plog_warn, Error, Result};

/// The Monitor and Relay tasks serving one worker.
#[derive(Debug)]
pub struct WorkerTasks {
    pub monitor: JoinHandle<()>,
    pub relay: JoinHandle<()>,
}

impl WorkerTasks {
    /// Wait for both tasks to finish.
    pub async fn join(self) -> Result<()> {
        let (monitor, relay) = tokio::join!(self.monitor, self.relay);
        monitor.map_err(|e| Error::TaskJoin(e.to_string()))?;
        relay.map_err(|e| Error::TaskJoin(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug)]
struct WorkerEntry {
    id: WorkerId,
    model: String,
    port: u16,
    launched_at: DateTime<Utc>,
    state: WorkerState,
    child: Option<Child>,
    pid: Option<u32>,
    tasks: Option<WorkerTasks>,
    /// Set once a stop has taken the tasks; flips to `true` when it finishes.
    stopping: Option<watch::Receiver<bool>>,
    /// Termination was sent by a stop or a drop, not by a crash.
    stop_requested: bool,
}

impl WorkerEntry {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            model: self.model.clone(),
            port: self.port,
            pid: self.pid,
            launched_at: self.launched_at,
            state: self.state.clone(),
        }
    }
}

/// Outcome of [`WorkerRegistry::insert`].
#[derive(Debug, Clone)]
pub enum Insertion {
    /// A fresh `Starting` entry was created with this id.
    Inserted(WorkerId),
    /// A live worker already holds the model; nothing changed.
    Existing(WorkerSnapshot),
}

/// What a monitor poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Entry exists but its process is not attached yet.
    Pending,
    Alive,
    /// The process is gone; the terminal state has been recorded.
    /// `requested` is true when termination had been sent to it.
    Exited { state: WorkerState, requested: bool },
    /// The entry was removed or belongs to a newer launch.
    Gone,
}

/// Result of asking the registry to stop a worker.
#[derive(Debug)]
pub enum StopTicket {
    NotFound,
    /// The entry was still launching and was removed immediately.
    Removed(WorkerSnapshot),
    /// Termination was sent; join the tasks, call `remove_launch`, then
    /// send `true` on `done`.
    Pending {
        id: WorkerId,
        tasks: WorkerTasks,
        done: watch::Sender<bool>,
    },
    /// Another stop already owns the tasks; wait for it to send `true`.
    InProgress(watch::Receiver<bool>),
}

/// Synchronized map from model id to its worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    entries: Arc<Mutex<HashMap<String, WorkerEntry>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `model` in the `Starting` state.
    ///
    /// A no-op returning the existing worker when one is live. A worker in a
    /// terminal state is replaced.
    pub fn insert(&self, model: &str, port: u16) -> Insertion {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(model) {
            if existing.state.is_live() {
                return Insertion::Existing(existing.snapshot());
            }
            plog_debug!(
                "registry: replacing {} worker {} ({})",
                model,
                existing.id.short(),
                existing.state
            );
        }

        let id = WorkerId::new();
        entries.insert(
            model.to_string(),
            WorkerEntry {
                id,
                model: model.to_string(),
                port,
                launched_at: Utc::now(),
                state: WorkerState::Starting,
                child: None,
                pid: None,
                tasks: None,
                stopping: None,
                stop_requested: false,
            },
        );
        Insertion::Inserted(id)
    }

    /// Hand the spawned process and its tasks to the entry, moving it to
    /// `Running`. Gives them back if the entry was stopped in the meantime.
    pub fn attach(
        &self,
        model: &str,
        id: WorkerId,
        child: Child,
        tasks: WorkerTasks,
    ) -> std::result::Result<(), (Child, WorkerTasks)> {
        let mut entries = self.lock();
        match entries.get_mut(model) {
            Some(entry) if entry.id == id && entry.state == WorkerState::Starting => {
                entry.pid = child.id();
                entry.child = Some(child);
                entry.tasks = Some(tasks);
                entry.launched_at = Utc::now();
                entry.state = WorkerState::Running;
                Ok(())
            }
            _ => Err((child, tasks)),
        }
    }

    pub fn lookup(&self, model: &str) -> Option<WorkerSnapshot> {
        self.lock().get(model).map(WorkerEntry::snapshot)
    }

    /// Remove an entry regardless of state. Dropping the handle kills a live process.
    pub fn remove(&self, model: &str) -> Option<WorkerSnapshot> {
        self.lock().remove(model).map(|entry| entry.snapshot())
    }

    /// Remove the entry only if it still belongs to launch `id`.
    pub fn remove_launch(&self, model: &str, id: WorkerId) -> Option<WorkerSnapshot> {
        let mut entries = self.lock();
        if entries.get(model).is_some_and(|entry| entry.id == id) {
            return entries.remove(model).map(|entry| entry.snapshot());
        }
        None
    }

    /// Snapshots of every entry, sorted by port.
    pub fn list_all(&self) -> Vec<WorkerSnapshot> {
        let mut all: Vec<_> = self.lock().values().map(WorkerEntry::snapshot).collect();
        all.sort_by_key(|w| w.port);
        all
    }

    pub fn models(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Check launch `id` of `model` for exit and record a terminal state.
    pub fn poll_exit(&self, model: &str, id: WorkerId) -> PollOutcome {
        let mut entries = self.lock();
        let entry = match entries.get_mut(model) {
            Some(entry) if entry.id == id => entry,
            _ => return PollOutcome::Gone,
        };
        let requested = entry.stop_requested;
        if entry.state.is_terminal() {
            return PollOutcome::Exited {
                state: entry.state.clone(),
                requested,
            };
        }
        let Some(child) = entry.child.as_mut() else {
            return PollOutcome::Pending;
        };

        let state = match child.try_wait() {
            Ok(None) => return PollOutcome::Alive,
            Ok(Some(status)) => WorkerState::from_exit_code(exit_code(status)),
            Err(e) => WorkerState::Failed {
                code: None,
                reason: format!("could not read exit status: {}", e),
            },
        };
        entry.state = state.clone();
        PollOutcome::Exited { state, requested }
    }

    /// Send termination to `model` and take its tasks so the caller can join them.
    ///
    /// Only a stop that is first to reach an attached worker gets the tasks.
    /// Later stops get a receiver for that stop's completion.
    pub fn begin_stop(&self, model: &str) -> StopTicket {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(model) else {
            return StopTicket::NotFound;
        };

        // A closed channel means the owning stop was dropped before finishing.
        if let Some(done) = entry.stopping.as_ref().filter(|d| d.has_changed().is_ok()) {
            return StopTicket::InProgress(done.clone());
        }

        match entry.tasks.take() {
            Some(tasks) => {
                send_termination(model, entry);
                let (done, stopping) = watch::channel(false);
                entry.stopping = Some(stopping);
                StopTicket::Pending {
                    id: entry.id,
                    tasks,
                    done,
                }
            }
            None => match entries.remove(model) {
                Some(entry) => StopTicket::Removed(entry.snapshot()),
                None => StopTicket::NotFound,
            },
        }
    }

    /// Send termination to every attached worker without waiting. Returns
    /// how many of them were still live.
    pub fn terminate_all(&self) -> usize {
        let mut entries = self.lock();
        let mut live = 0;
        for (model, entry) in entries.iter_mut().filter(|(_, e)| e.child.is_some()) {
            if entry.state.is_live() {
                live += 1;
            }
            send_termination(model, entry);
        }
        live
    }
}

/// Exit code for a status; signal deaths map to `128 + signal` on unix.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn send_termination(model: &str, entry: &mut WorkerEntry) {
    entry.stop_requested = true;
    if let (Some(pid), Some(child)) = (entry.pid, entry.child.as_mut()) {
        terminate_process(model, pid, child);
    }
}

/// SIGTERM the worker's whole process group.
///
/// Workers lead their own group, so descendants still holding the output
/// pipe are signalled too, even after the worker itself has exited.
#[cfg(unix)]
pub(crate) fn terminate_process(model: &str, pid: u32, _child: &mut Child) {
    plog_debug!("registry: SIGTERM {} pgid={}", model, pid);
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Nothing left in the group.
        if err.raw_os_error() != Some(libc::ESRCH) {
            plog_warn!("registry: failed to signal {} pgid={}: {}", model, pid, err);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_process(model: &str, _pid: u32, child: &mut Child) {
    if !matches!(child.try_wait(), Ok(None)) {
        return;
    }
    plog_debug!("registry: kill {}", model);
    if let Err(e) = child.start_kill() {
        plog_warn!("registry: failed to kill {}: {}", model, e);
    }
}
