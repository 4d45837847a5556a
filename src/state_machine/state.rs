use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::{ExecutionResult, Job, JobError, JobParameters};

/// Lifecycle status of a job.
///
/// Pending → Running → one of {Completed, Cancelled, Error}. The three
/// terminal statuses admit no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Error
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Owns a [`Job`] and serializes every mutation to it.
///
/// No other component writes job fields directly: the coordinator drives the
/// lifecycle through the transition methods, queries go through the
/// accessors. Each mutator returns whether the transition was applied;
/// transitions out of a terminal status are refused.
#[derive(Debug)]
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(params: JobParameters) -> Self {
        Self {
            job: Job::new(params),
        }
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    /// Pending → Running. If cancellation was already requested, the job
    /// goes straight to Cancelled and no attempt may start.
    pub fn start(&mut self) -> bool {
        if self.job.status != JobStatus::Pending {
            return false;
        }
        if self.job.cancel_requested {
            self.job.status = JobStatus::Cancelled;
        } else {
            self.job.status = JobStatus::Running;
        }
        self.touch();
        true
    }

    /// Record that one launch attempt is beginning.
    pub fn begin_attempt(&mut self) -> bool {
        if self.job.status != JobStatus::Running {
            return false;
        }
        self.job.attempts += 1;
        self.touch();
        true
    }

    /// Record the classified failure of the most recent attempt.
    pub fn record_error(&mut self, error: JobError) -> bool {
        if self.job.status.is_terminal() {
            return false;
        }
        self.job.last_error = Some(error);
        self.touch();
        true
    }

    /// Running → Completed with the attempt's result.
    pub fn complete(&mut self, result: ExecutionResult) -> bool {
        if self.job.status != JobStatus::Running {
            return false;
        }
        self.job.status = JobStatus::Completed;
        self.job.result = Some(result);
        self.touch();
        true
    }

    /// Running (or Pending) → Cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.job.status.is_terminal() {
            return false;
        }
        self.job.status = JobStatus::Cancelled;
        self.touch();
        true
    }

    /// Running → Error, after exhausted retries or a non-retryable failure.
    pub fn fail(&mut self) -> bool {
        if self.job.status.is_terminal() {
            return false;
        }
        self.job.status = JobStatus::Error;
        self.touch();
        true
    }

    /// Note an external cancellation request on the job record.
    ///
    /// Idempotent. A request arriving after a terminal status leaves the
    /// flag set but never affects the finished job.
    pub fn request_cancellation(&mut self) {
        if !self.job.cancel_requested {
            self.job.cancel_requested = true;
            self.touch();
        }
    }

    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn attempts(&self) -> u32 {
        self.job.attempts
    }

    pub fn last_error(&self) -> Option<&JobError> {
        self.job.last_error.as_ref()
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.job.result.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.job.cancel_requested
    }

    pub fn id(&self) -> uuid::Uuid {
        self.job.id
    }

    pub fn params(&self) -> &JobParameters {
        &self.job.params
    }

    /// Clone of the current job record, for persistence and reporting.
    pub fn snapshot(&self) -> Job {
        self.job.clone()
    }

    fn touch(&mut self) {
        self.job.updated_at = Utc::now();
    }
}
