pub mod config;
pub mod error;
pub mod log;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result, StartFailure};
pub use supervisor::{Orchestrator, OrchestratorSettings, StreamEndpoints};
pub use worker::{WorkerId, WorkerSnapshot, WorkerState};
