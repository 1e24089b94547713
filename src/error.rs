use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// No isolated runtime is configured for the model.
    #[error("No environment configured for model '{model}'")]
    Configuration { model: String },

    /// The OS refused to start the worker process.
    #[error("Failed to launch worker for '{model}': {source}")]
    Launch {
        model: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker exited with a nonzero code after it was launched.
    #[error("Worker '{model}' exited with code {code}")]
    RuntimeExit { model: String, code: i32 },

    #[error("{} of the requested models failed to launch: {}", .0.len(), summarize(.0))]
    AggregateStart(Vec<StartFailure>),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
}

impl Error {
    /// Per-model failures carried by an aggregate start error.
    pub fn failures(&self) -> &[StartFailure] {
        match self {
            Error::AggregateStart(failures) => failures,
            _ => &[],
        }
    }
}

/// One model that could not be launched during a multi-model start.
#[derive(Debug)]
pub struct StartFailure {
    pub model: String,
    pub error: Error,
}

fn summarize(failures: &[StartFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.model, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
