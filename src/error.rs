use std::fmt;

use thiserror::Error;

/// Result type alias for passage operations
pub type PassageResult<T> = Result<T, PassageError>;

/// Error types for the passage library
#[derive(Error, Debug)]
pub enum PassageError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Aggregated configuration validation errors
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// SSH connection errors
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Dial failures after the retry bound was exhausted
    #[error("{source}, after {attempts} attempts")]
    Dial {
        attempts: u32,
        source: Box<PassageError>,
    },

    /// Network address errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener lifecycle errors
    #[error("Listener error: {0}")]
    Listener(String),

    /// No running container matched the configured name
    #[error("container {0:?} not found")]
    ContainerNotFound(String),

    /// The container has no address on a supported network
    #[error("container {0:?}: unsupported network configuration")]
    UnsupportedNetwork(String),

    /// Container API errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Control lookups for an unknown passage
    #[error("unable to find a passage with name {0:?}")]
    NoSuchPassage(String),

    /// Control protocol errors
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Timeout errors
    #[error("Operation timed out")]
    Timeout,

    /// A failure attributed to one passage
    #[error("passage {name:?}: {source}")]
    Passage {
        name: String,
        source: Box<PassageError>,
    },

    /// Passages that failed to start during a load
    #[error("{}", render_list("Failed to load configuration", .0))]
    Load(Vec<PassageError>),
}

impl From<russh::Error> for PassageError {
    fn from(err: russh::Error) -> Self {
        PassageError::Ssh(err.to_string())
    }
}

impl From<serde_json::Error> for PassageError {
    fn from(err: serde_json::Error) -> Self {
        PassageError::Rpc(err.to_string())
    }
}

impl From<hyper::Error> for PassageError {
    fn from(err: hyper::Error) -> Self {
        PassageError::Http(err.to_string())
    }
}

/// Every problem found while validating a configuration, reported at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub errors: Vec<String>,
}

impl ConfigError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_list("Invalid configuration", &self.errors))
    }
}

impl std::error::Error for ConfigError {}

fn render_list<T: fmt::Display>(title: &str, items: &[T]) -> String {
    let lines: Vec<String> = items.iter().map(|e| format!("\t{e}")).collect();
    format!(
        "{title}, found {} error(s):\n{}",
        lines.len(),
        lines.join("\n")
    )
}
