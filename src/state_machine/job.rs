use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, JobrunError, LaunchError};

use super::state::JobStatus;

/// Caller-supplied description of what to run and how.
///
/// Immutable once submitted. `timeout_secs` must be greater than zero;
/// [`JobParameters::validate`] enforces it before the engine accepts a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameters {
    /// Path to the executable.
    pub program: PathBuf,
    /// Arguments passed verbatim, no shell interpretation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child; inherits the engine's when absent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Per-attempt wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Environment overrides merged over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Capture standard output of the child.
    #[serde(default = "default_capture")]
    pub capture_stdout: bool,
    /// Capture standard error of the child.
    #[serde(default = "default_capture")]
    pub capture_stderr: bool,
}

fn default_capture() -> bool {
    true
}

impl JobParameters {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout_secs: 60,
            env: HashMap::new(),
            capture_stdout: true,
            capture_stderr: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check submission invariants.
    pub fn validate(&self) -> Result<(), JobrunError> {
        if self.timeout_secs == 0 {
            return Err(JobrunError::InvalidParameters(
                "timeout must be greater than zero".into(),
            ));
        }
        if self.program.as_os_str().is_empty() {
            return Err(JobrunError::InvalidParameters(
                "program path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// The outcome of one attempt whose process ran to natural exit.
///
/// A nonzero exit code is a valid result, not a failure; the retry
/// machinery never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Captured stdout, one entry per line, in arrival order.
    pub stdout: Vec<String>,
    /// Captured stderr, one entry per line, in arrival order.
    pub stderr: Vec<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Serializable record of the last failed attempt, kept for diagnostics.
/// The kind is assigned once by the coordinator and never reclassified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn from_launch(err: &LaunchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One request to run an external executable, tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub params: JobParameters,
    pub status: JobStatus,
    /// Launch attempts made so far; incremented once per attempt.
    pub attempts: u32,
    pub last_error: Option<JobError>,
    /// Set only on a Completed terminal attempt.
    pub result: Option<ExecutionResult>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(params: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            params,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            result: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(id: Uuid, params: JobParameters) -> Self {
        let mut job = Self::new(params);
        job.id = id;
        job
    }
}
