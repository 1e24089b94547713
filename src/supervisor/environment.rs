//! Per-model isolated runtime lookup.
//!
//! The resolver is a static table built once from configuration. Lookups never
//! touch the filesystem; a missing executable surfaces later as a launch error.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::config::{expand_tilde, Config, EnvironmentEntry};
use crate::{Error, Result};

/// Variable marking the isolation root, as a virtualenv activation would.
pub const ISOLATION_ROOT_VAR: &str = "VIRTUAL_ENV";
/// Interpreter home; removed so the isolated runtime is not overridden.
pub const INTERPRETER_HOME_VAR: &str = "PYTHONHOME";
/// Shared model cache location.
pub const CACHE_DIR_VAR: &str = "HUGGINGFACE_HUB_CACHE";

/// A single change to the inherited environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Set(String),
    /// Prepend to the inherited value using the platform path separator.
    PrependPath(PathBuf),
    Remove,
}

/// Isolated runtime configuration for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub root: PathBuf,
    pub executable: PathBuf,
    pub overlay: BTreeMap<String, EnvChange>,
}

impl EnvironmentDescriptor {
    /// Build a descriptor from a runtime root and the shared cache directory.
    pub fn new(root: &Path, executable: Option<&Path>, cache_dir: &Path) -> Self {
        let bin_dir = root.join("bin");
        let executable = executable
            .map(Path::to_path_buf)
            .unwrap_or_else(|| bin_dir.join("python"));

        let mut overlay = BTreeMap::new();
        overlay.insert(
            ISOLATION_ROOT_VAR.to_string(),
            EnvChange::Set(root.display().to_string()),
        );
        overlay.insert("PATH".to_string(), EnvChange::PrependPath(bin_dir));
        overlay.insert(INTERPRETER_HOME_VAR.to_string(), EnvChange::Remove);
        overlay.insert(
            CACHE_DIR_VAR.to_string(),
            EnvChange::Set(cache_dir.display().to_string()),
        );

        Self {
            root: root.to_path_buf(),
            executable,
            overlay,
        }
    }

    /// Add or replace an overlay variable.
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.overlay
            .insert(key.to_string(), EnvChange::Set(value.to_string()));
        self
    }

    /// Both the runtime root and the executable must be absolute; a bare
    /// program name would otherwise be looked up on `PATH`.
    pub fn validate(&self, model: &str) -> Result<()> {
        for path in [&self.root, &self.executable] {
            if !path.is_absolute() {
                return Err(Error::Validation(format!(
                    "environment for '{}' must use absolute paths, got {}",
                    model,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn from_entry(entry: &EnvironmentEntry, cache_dir: &Path) -> Self {
        let root = expand_tilde(&entry.root);
        let executable = entry.executable.as_deref().map(expand_tilde);
        entry.env.iter().fold(
            Self::new(&root, executable.as_deref(), cache_dir),
            |desc, (key, value)| desc.with_var(key, value),
        )
    }
}

/// Maps model identifiers to their isolated runtimes.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentResolver {
    entries: HashMap<String, EnvironmentDescriptor>,
}

impl EnvironmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let cache_dir = config.model_dir_path();
        let mut resolver = Self::new();
        for (model, entry) in &config.environments {
            resolver.register(model, EnvironmentDescriptor::from_entry(entry, &cache_dir))?;
        }
        Ok(resolver)
    }

    pub fn register(&mut self, model: &str, descriptor: EnvironmentDescriptor) -> Result<()> {
        descriptor.validate(model)?;
        self.entries.insert(model.to_string(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, model: &str) -> Result<&EnvironmentDescriptor> {
        self.entries.get(model).ok_or_else(|| Error::Configuration {
            model: model.to_string(),
        })
    }

    /// Registered model ids, sorted.
    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }
}
