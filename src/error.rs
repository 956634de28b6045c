use thiserror::Error;

/// Daemon-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration missing: {0}")]
    ConfigAbsent(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request denied: {0}")]
    PolicyDenied(String),

    #[error("mode transition failed: {0}")]
    TransitionFailed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the error should take the daemon down when it reaches the main loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
