//! Orchestration facade: starts and stops one worker per requested model.
//!
//! `start` returns as soon as every requested model has been launched. It does
//! not wait for workers to become ready, and a worker that crashes later is
//! only visible through the log and its registry state.
//!
//! `stop` signals termination and then waits for the worker's Monitor and
//! Relay tasks without a deadline. A worker that ignores SIGTERM keeps the
//! caller waiting.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Child;

use super::environment::EnvironmentResolver;
use super::launcher::{self, LaunchOptions, LaunchSpec};
use super::monitor::spawn_monitor;
use super::registry::{terminate_process, Insertion, StopTicket, WorkerRegistry, WorkerTasks};
use super::relay::{spawn_relay, OutputTail};
use crate::config::{Config, DEFAULT_BASE_PORT, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_TAIL_LINES};
use crate::error::StartFailure;
use crate::log::{HostLogSink, LogSink};
use crate::worker::{WorkerId, WorkerSnapshot};
use crate::{plog, plog_debug, plog_error, plog_warn, Error, Result};

static MODEL_SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,;\s]+").unwrap());

/// Split a delimited model list, dropping empty items.
pub fn parse_model_ids(models: &str) -> Vec<String> {
    MODEL_SEPARATOR_RE
        .split(models)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

/// Stream addresses shared by every worker of one start request.
///
/// Passed through to the workers untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndpoints {
    pub subscribe_url: String,
    pub publish_url: String,
}

impl StreamEndpoints {
    pub fn new(subscribe_url: impl Into<String>, publish_url: impl Into<String>) -> Self {
        Self {
            subscribe_url: subscribe_url.into(),
            publish_url: publish_url.into(),
        }
    }
}

/// Launch settings shared by every worker.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base_port: u16,
    pub poll_interval: Duration,
    pub entrypoint: Vec<String>,
    /// Passed as `--model-dir` when set.
    pub model_dir: Option<PathBuf>,
    pub tail_lines: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            entrypoint: Vec::new(),
            model_dir: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            base_port: config.base_port,
            poll_interval: config.poll_interval(),
            entrypoint: config.entrypoint.clone(),
            model_dir: Some(config.model_dir_path()),
            tail_lines: config.tail_lines,
        }
    }
}

/// What happened to one model of a start request.
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    Launched { model: String, id: WorkerId, port: u16 },
    /// A live worker already served the model; nothing was spawned.
    AlreadyRunning(WorkerSnapshot),
}

impl LaunchOutcome {
    pub fn model(&self) -> &str {
        match self {
            LaunchOutcome::Launched { model, .. } => model,
            LaunchOutcome::AlreadyRunning(snapshot) => &snapshot.model,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            LaunchOutcome::Launched { port, .. } => *port,
            LaunchOutcome::AlreadyRunning(snapshot) => snapshot.port,
        }
    }
}

/// Supervises the workers of a streaming pipeline.
///
/// Dropping the orchestrator sends termination to every worker it still
/// tracks. Call [`Orchestrator::shutdown`] to also wait for them.
pub struct Orchestrator {
    resolver: EnvironmentResolver,
    registry: WorkerRegistry,
    settings: OrchestratorSettings,
    sink: Arc<dyn LogSink>,
}

impl Orchestrator {
    pub fn new(resolver: EnvironmentResolver, settings: OrchestratorSettings) -> Self {
        Self {
            resolver,
            registry: WorkerRegistry::new(),
            settings,
            sink: Arc::new(HostLogSink),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            EnvironmentResolver::from_config(config)?,
            OrchestratorSettings::from(config),
        ))
    }

    /// Route relayed worker output somewhere other than the host log.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Launch a worker for each model, on `base_port + index`.
    ///
    /// Models that fail to launch are collected into
    /// [`Error::AggregateStart`]; workers already started by the same call keep
    /// running.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        models: &[String],
        endpoints: &StreamEndpoints,
        params: &serde_json::Value,
    ) -> Result<Vec<LaunchOutcome>> {
        let initial_params = serde_json::to_string(params)?;
        let mut outcomes = Vec::with_capacity(models.len());
        let mut failures = Vec::new();

        for (index, model) in models.iter().enumerate() {
            let launched = self
                .port_for(index)
                .and_then(|port| self.launch(model, port, endpoints, &initial_params));
            match launched {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    plog_error!("Failed to start worker for {}: {}", model, error);
                    failures.push(StartFailure {
                        model: model.clone(),
                        error,
                    });
                }
            }
        }

        plog!(
            "Starting stream with models {:?}, subscribe={} publish={}",
            models,
            endpoints.subscribe_url,
            endpoints.publish_url
        );

        if failures.is_empty() {
            Ok(outcomes)
        } else {
            Err(Error::AggregateStart(failures))
        }
    }

    /// [`Orchestrator::start`] for a delimited model list such as `"a,b"`.
    pub fn start_list(
        &self,
        models: &str,
        endpoints: &StreamEndpoints,
        params: &serde_json::Value,
    ) -> Result<Vec<LaunchOutcome>> {
        let models = parse_model_ids(models);
        if models.is_empty() {
            return Err(Error::Validation("no models requested".to_string()));
        }
        self.start(&models, endpoints, params)
    }

    fn port_for(&self, index: usize) -> Result<u16> {
        u16::try_from(index)
            .ok()
            .and_then(|offset| self.settings.base_port.checked_add(offset))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "port {} + {} is out of range",
                    self.settings.base_port, index
                ))
            })
    }

    fn launch(
        &self,
        model: &str,
        port: u16,
        endpoints: &StreamEndpoints,
        initial_params: &str,
    ) -> Result<LaunchOutcome> {
        if let Some(existing) = self.registry.lookup(model).filter(|w| w.state.is_live()) {
            plog_debug!("{} already tracked ({}), not launching", model, existing.state);
            return Ok(LaunchOutcome::AlreadyRunning(existing));
        }

        let environment = self.resolver.resolve(model)?;
        let mut options = LaunchOptions::new();
        options
            .set("pipeline", model)
            .set("http_port", port)
            .set("subscribe_url", &endpoints.subscribe_url)
            .set("publish_url", &endpoints.publish_url)
            .set("initial_params", initial_params);
        if let Some(dir) = &self.settings.model_dir {
            options.set("model_dir", dir.display());
        }
        let spec = LaunchSpec::build(model, environment, &self.settings.entrypoint, &options)?;

        let id = match self.registry.insert(model, port) {
            Insertion::Inserted(id) => id,
            Insertion::Existing(existing) => return Ok(LaunchOutcome::AlreadyRunning(existing)),
        };

        let spawned = match launcher::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.registry.remove_launch(model, id);
                return Err(e);
            }
        };

        let tail = Arc::new(OutputTail::new(self.settings.tail_lines));
        let tasks = WorkerTasks {
            relay: spawn_relay(
                model.to_string(),
                spawned.output,
                Arc::clone(&self.sink),
                Arc::clone(&tail),
            ),
            monitor: spawn_monitor(
                self.registry.clone(),
                model.to_string(),
                id,
                tail,
                self.settings.poll_interval,
            ),
        };

        if let Err((child, tasks)) = self.registry.attach(model, id, spawned.child, tasks) {
            plog_warn!("{} was stopped while launching; terminating it", model);
            release_orphan(model, child, tasks);
            return Err(Error::WorkerNotFound(model.to_string()));
        }

        plog!("Launched worker {} ({}) on port {}", model, id.short(), port);
        Ok(LaunchOutcome::Launched {
            model: model.to_string(),
            id,
            port,
        })
    }

    /// Stop one worker and wait for its tasks. Returns `false` for an
    /// untracked model.
    pub async fn stop(&self, model: &str) -> Result<bool> {
        match self.registry.begin_stop(model) {
            StopTicket::NotFound => Ok(false),
            StopTicket::Removed(_) => {
                plog_debug!("Removed {} before it was running", model);
                Ok(true)
            }
            StopTicket::Pending { id, tasks, done } => {
                let joined = tasks.join().await;
                self.registry.remove_launch(model, id);
                done.send_replace(true);
                plog!("Stopped worker {}", model);
                joined.map(|_| true)
            }
            StopTicket::InProgress(mut done) => {
                plog_debug!("{} is already stopping; waiting for it", model);
                // Err means the owning stop was dropped; the next begin_stop cleans up.
                let finished = done.wait_for(|stopped| *stopped).await.is_ok();
                Ok(finished || self.registry.lookup(model).is_none())
            }
        }
    }

    /// Stop every tracked worker. The registry is empty afterwards.
    pub async fn stop_all(&self) -> Result<usize> {
        let mut stopped = 0;
        let mut first_error = None;

        while !self.registry.is_empty() {
            let models = self.registry.models();
            let results = join_all(models.iter().map(|model| self.stop(model))).await;
            for result in results {
                match result {
                    Ok(true) => stopped += 1,
                    Ok(false) => {}
                    Err(e) => {
                        plog_warn!("stop_all: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    /// Stop everything and release the orchestrator.
    pub async fn shutdown(self) -> Result<()> {
        self.stop_all().await.map(|_| ())
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.registry.list_all()
    }

    pub fn worker(&self, model: &str) -> Option<WorkerSnapshot> {
        self.registry.lookup(model)
    }

    pub fn is_running(&self, model: &str) -> bool {
        self.registry
            .lookup(model)
            .is_some_and(|w| w.state.is_live())
    }
}

/// Terminate a process whose launch lost its registry entry, then reap it
/// and its tasks in the background.
fn release_orphan(model: &str, mut child: Child, tasks: WorkerTasks) {
    if let Some(pid) = child.id() {
        terminate_process(model, pid, &mut child);
    }
    let model = model.to_string();
    tokio::spawn(async move {
        if let Err(e) = child.wait().await {
            plog_warn!("Could not reap orphaned {}: {}", model, e);
        }
        let _ = tasks.join().await;
    });
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let signalled = self.registry.terminate_all();
        if signalled > 0 {
            plog_warn!("Orchestrator dropped with {} live workers; terminated", signalled);
        }
    }
}
