use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobrunError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// A single failed launch attempt, as reported by the launcher.
///
/// The launcher never retries; it surfaces exactly one of these per attempt
/// and leaves the retry decision to the coordinator.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirNotFound(PathBuf),

    #[error("failed to launch process: {0}")]
    Spawn(String),

    #[error("attempt exceeded timeout of {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("cancellation requested")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl LaunchError {
    /// Collapse the error into the kind the retry policy classifies on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::ExecutableNotFound(_) | LaunchError::WorkingDirNotFound(_) => {
                ErrorKind::NotFound
            }
            LaunchError::Spawn(_) => ErrorKind::LaunchFailure,
            LaunchError::Timeout(_) => ErrorKind::Timeout,
            LaunchError::Cancelled => ErrorKind::Cancelled,
            LaunchError::Other(_) => ErrorKind::Other,
        }
    }
}

/// Classifies a failed attempt for retry-policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Executable or working directory missing. Never retryable.
    NotFound,
    /// The OS rejected process creation (e.g. permission denied).
    LaunchFailure,
    /// The attempt exceeded its timeout.
    Timeout,
    /// Cancellation was observed. Never retryable, wins over any other outcome.
    Cancelled,
    /// Anything else; treated conservatively as retryable until attempts exhaust.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::LaunchFailure => write!(f, "LaunchFailure"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::Other => write!(f, "Other"),
        }
    }
}
