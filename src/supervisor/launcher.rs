//! Launch specifications and worker process creation.
//!
//! A worker is started directly from its isolated runtime's executable with a
//! discrete argument vector. No shell is involved, so option values reach the
//! worker byte-for-byte and never need escaping.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::PipeReader;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::environment::{EnvChange, EnvironmentDescriptor};
use crate::{plog_debug, Error, Result};

/// Ordered key/value options rendered into `--flag value` pairs.
///
/// Keys use underscores internally (`http_port`) and are rendered as
/// kebab-case flags (`--http-port`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    entries: Vec<(String, String)>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option, replacing an earlier value for the same key in place.
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(key, value)| [flag_name(key), value.clone()])
            .collect()
    }
}

/// `http_port` -> `--http-port`
pub fn flag_name(key: &str) -> String {
    format!("--{}", key.replace('_', "-"))
}

/// Everything needed to start one worker, resolved up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub model: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `Some` sets the variable, `None` removes it from the inherited environment.
    pub env: BTreeMap<String, Option<OsString>>,
}

impl LaunchSpec {
    pub fn build(
        model: &str,
        environment: &EnvironmentDescriptor,
        entrypoint: &[String],
        options: &LaunchOptions,
    ) -> Result<Self> {
        environment.validate(model)?;
        let mut env = BTreeMap::new();
        for (key, change) in &environment.overlay {
            let value = match change {
                EnvChange::Set(value) => Some(OsString::from(value)),
                EnvChange::PrependPath(dir) => Some(prepend_path(dir, std::env::var_os(key))?),
                EnvChange::Remove => None,
            };
            env.insert(key.clone(), value);
        }

        let mut args = entrypoint.to_vec();
        args.extend(options.render());

        Ok(Self {
            model: model.to_string(),
            program: environment.executable.clone(),
            args,
            env,
        })
    }

    fn command(&self, output: std::io::PipeWriter) -> std::io::Result<Command> {
        let errors = output.try_clone()?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(errors))
            .kill_on_drop(true);
        // Own process group, so termination reaches anything the worker forks.
        #[cfg(unix)]
        command.process_group(0);
        for (key, value) in &self.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        Ok(command)
    }
}

fn prepend_path(dir: &std::path::Path, inherited: Option<OsString>) -> Result<OsString> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(inherited) = inherited.as_deref() {
        paths.extend(std::env::split_paths(inherited));
    }
    std::env::join_paths(paths).map_err(|e| Error::Validation(e.to_string()))
}

/// A freshly started worker. `output` carries stdout and stderr merged.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub output: PipeReader,
}

/// Start one OS process for the spec. Does not wait for the worker to be ready.
pub fn spawn(spec: &LaunchSpec) -> Result<SpawnedProcess> {
    let launch_error = |source| Error::Launch {
        model: spec.model.clone(),
        source,
    };

    plog_debug!(
        "launcher::spawn model={} program={} args={:?}",
        spec.model,
        spec.program.display(),
        spec.args
    );

    let (output, writer) = std::io::pipe().map_err(launch_error)?;
    // The command holds the write ends; it must be gone once the child has
    // them, otherwise the reader never sees end-of-file.
    let child = {
        let mut command = spec.command(writer).map_err(launch_error)?;
        command.spawn().map_err(launch_error)?
    };

    plog_debug!("launcher::spawn model={} pid={:?}", spec.model, child.id());
    Ok(SpawnedProcess { child, output })
}
