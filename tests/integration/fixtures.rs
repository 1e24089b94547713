//! Test fixtures for integration tests.
//!
//! Workers are played by `/bin/sh -c <script>`, so no executable files need
//! to be written. The script dispatches on the model id (`$2`, right after
//! `--pipeline`):
//!
//! - `echo*`: prints its arguments and environment, then idles
//! - `lines*`: prints 200 numbered lines and exits 0
//! - `ok*`: exits 0 immediately
//! - `crash*`: prints a message and exits 137
//! - `stubborn*`: ignores SIGTERM and idles until killed
//! - `orphan*`: forks a long sleep that keeps the output open, then exits 1
//! - anything else: idles until terminated

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pipevisor::log::MemorySink;
use pipevisor::supervisor::{EnvironmentDescriptor, EnvironmentResolver};
use pipevisor::{Orchestrator, OrchestratorSettings, StreamEndpoints, WorkerState};

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const WORKER_SCRIPT: &str = r#"
model="$2"
case "$model" in
  echo*)
    for a in "$@"; do printf 'arg:%s\n' "$a"; done
    echo "env:VIRTUAL_ENV=$VIRTUAL_ENV"
    echo "env:PYTHONHOME=${PYTHONHOME-unset}"
    echo "env:HUGGINGFACE_HUB_CACHE=$HUGGINGFACE_HUB_CACHE"
    echo "env:PATH=$PATH"
    echo "ready"
    exec sleep 30
    ;;
  lines*)
    i=1
    while [ $i -le 200 ]; do echo "line $i"; i=$((i+1)); done
    exit 0
    ;;
  ok*)
    exit 0
    ;;
  crash*)
    echo "fatal: out of memory" >&2
    exit 137
    ;;
  stubborn*)
    trap '' TERM
    echo "ready"
    while :; do sleep 1; done
    ;;
  orphan*)
    sleep 30 &
    echo "forked"
    exit 1
    ;;
  *)
    exec sleep 30
    ;;
esac
"#;

/// An isolated-runtime root on disk plus an orchestrator wired to it.
pub struct Harness {
    pub temp_dir: TempDir,
    pub sink: Arc<MemorySink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    /// Orchestrator that knows the given models, on base port 8888.
    pub fn new(models: &[&str]) -> Self {
        Self::with_base_port(models, 8888)
    }

    pub fn with_base_port(models: &[&str], base_port: u16) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("venv");
        std::fs::create_dir_all(root.join("bin")).expect("Failed to create venv dir");

        let mut resolver = EnvironmentResolver::new();
        for model in models {
            resolver
                .register(
                    model,
                    EnvironmentDescriptor::new(
                        &root,
                        Some(std::path::Path::new("/bin/sh")),
                        &temp_dir.path().join("cache"),
                    ),
                )
                .expect("Failed to register environment");
        }

        let settings = OrchestratorSettings {
            base_port,
            poll_interval: POLL_INTERVAL,
            entrypoint: vec![
                "-c".to_string(),
                WORKER_SCRIPT.to_string(),
                "fake-worker".to_string(),
            ],
            model_dir: Some(temp_dir.path().join("models")),
            tail_lines: 20,
        };

        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::new(resolver, settings).with_sink(sink.clone());

        Self {
            temp_dir,
            sink,
            orchestrator,
        }
    }

    pub fn venv_root(&self) -> PathBuf {
        self.temp_dir.path().join("venv")
    }

    /// Poll until the model's state satisfies `pred`.
    pub async fn wait_for_state<F>(&self, model: &str, pred: F) -> WorkerState
    where
        F: Fn(&WorkerState) -> bool,
    {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(worker) = self.orchestrator.worker(model) {
                if pred(&worker.state) {
                    return worker.state;
                }
            }
            assert!(
                Instant::now() < deadline,
                "Timed out waiting for {} (state: {:?})",
                model,
                self.orchestrator.worker(model).map(|w| w.state)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the relay has delivered `line` for `model`.
    pub async fn wait_for_line(&self, model: &str, line: &str) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while !self.sink.lines_for(model).iter().any(|l| l == line) {
            assert!(
                Instant::now() < deadline,
                "Timed out waiting for line {:?} from {}; got {:?}",
                line,
                model,
                self.sink.lines_for(model)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Whether `pid` still exists (a zombie counts).
pub fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn endpoints() -> StreamEndpoints {
    StreamEndpoints::new("http://127.0.0.1:3389/in", "http://127.0.0.1:3389/out")
}

pub fn models(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn params() -> serde_json::Value {
    serde_json::json!({ "prompt": "talking head, it's \"cyberpunk\"", "seed": 42 })
}
