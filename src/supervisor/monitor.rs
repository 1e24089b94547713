//! Lifecycle Monitor: polls one worker's process until it exits.
//!
//! The monitor records the terminal state in the registry and reports it to
//! the log. It never restarts a worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::registry::{PollOutcome, WorkerRegistry};
use super::relay::OutputTail;
use crate::worker::{WorkerId, WorkerState};
use crate::log::{self, LogLevel};
use crate::{plog, plog_debug, plog_trace, Error};

/// How long a failed worker's report waits for the relay to drain.
pub const TAIL_GRACE: Duration = Duration::from_secs(2);

pub fn spawn_monitor(
    registry: WorkerRegistry,
    model: String,
    id: WorkerId,
    tail: Arc<OutputTail>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some((state, requested)) = watch_worker(&registry, &model, id, poll_interval).await
        {
            report_exit(&model, &state, requested, &tail).await;
        }
    })
}

/// Poll until the worker exits, returning its terminal state and whether
/// termination had been requested. `None` means the entry disappeared first.
pub async fn watch_worker(
    registry: &WorkerRegistry,
    model: &str,
    id: WorkerId,
    poll_interval: Duration,
) -> Option<(WorkerState, bool)> {
    loop {
        match registry.poll_exit(model, id) {
            PollOutcome::Exited { state, requested } => return Some((state, requested)),
            PollOutcome::Gone => {
                plog_debug!("monitor: {} ({}) no longer tracked", model, id.short());
                return None;
            }
            PollOutcome::Alive => plog!("Worker {} is running...", model),
            PollOutcome::Pending => plog_trace!("monitor: {} not attached yet", model),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn report_exit(model: &str, state: &WorkerState, requested: bool, tail: &OutputTail) {
    if matches!(state, WorkerState::Failed { code: Some(_), .. }) && !requested {
        let _ = tokio::time::timeout(TAIL_GRACE, tail.closed()).await;
    }
    if let Some((level, message)) = exit_message(model, state, requested, &tail.lines()) {
        log::log_at(level, &message);
    }
}

/// Log record for a terminal state. A nonzero exit that follows a stop or
/// drop is expected and stays at INFO.
fn exit_message(
    model: &str,
    state: &WorkerState,
    requested: bool,
    tail: &[String],
) -> Option<(LogLevel, String)> {
    match state {
        WorkerState::Exited { code } => Some((
            LogLevel::Info,
            format!("Worker {} completed. Return code: {}", model, code),
        )),
        WorkerState::Failed {
            code: Some(code), ..
        } if requested => Some((
            LogLevel::Info,
            format!("Worker {} stopped with code {}", model, code),
        )),
        WorkerState::Failed {
            code: Some(code), ..
        } => {
            let err = Error::RuntimeExit {
                model: model.to_string(),
                code: *code,
            };
            Some((
                LogLevel::Error,
                format!("{}. Last output:\n{}", err, tail.join("\n")),
            ))
        }
        WorkerState::Failed { code: None, reason } => Some((
            LogLevel::Error,
            format!("Worker {} failed: {}", model, reason),
        )),
        WorkerState::Starting | WorkerState::Running => None,
    }
}
