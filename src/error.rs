use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Top-level error taxonomy for the daemon.
///
/// Worker tasks (the reconciler walk, an individual upload) catch and log
/// their own errors internally and keep running; only the variants below
/// cross a task boundary and can end up on the lifecycle task's plate.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("configuration error in field `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("state store is corrupt: {0}")]
    StateStoreCorrupt(String),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error("watched root unavailable: {0}")]
    RootUnavailable(std::path::PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl AdapterError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }
}
