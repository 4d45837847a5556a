mod job;
mod state;

pub use job::{ExecutionResult, Job, JobError, JobParameters};
pub use state::{JobStateMachine, JobStatus};
