//! Worker supervision for a live streaming pipeline.
//!
//! One out-of-process worker runs per model. The components, leaves first:
//!
//! - `environment`: resolves a model to its isolated runtime
//! - `launcher`: builds the launch specification and starts the process
//! - `registry`: synchronized model -> worker map, owner of process handles
//! - `monitor`: per-worker task polling for exit
//! - `relay`: per-worker task draining merged output into the log
//! - `orchestrator`: the public facade tying them together

mod environment;
mod launcher;
mod monitor;
mod orchestrator;
mod registry;
mod relay;

pub use environment::{
    EnvChange, EnvironmentDescriptor, EnvironmentResolver, CACHE_DIR_VAR, INTERPRETER_HOME_VAR,
    ISOLATION_ROOT_VAR,
};
pub use launcher::{flag_name, spawn, LaunchOptions, LaunchSpec, SpawnedProcess};
pub use monitor::{spawn_monitor, watch_worker, TAIL_GRACE};
pub use orchestrator::{
    parse_model_ids, LaunchOutcome, Orchestrator, OrchestratorSettings, StreamEndpoints,
};
pub use registry::{exit_code, Insertion, PollOutcome, StopTicket, WorkerRegistry, WorkerTasks};
pub use relay::{relay_lines, spawn_relay, OutputTail};
