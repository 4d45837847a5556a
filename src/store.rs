//! Persistence seam toward the durable-orchestration substrate.
//!
//! The engine does not implement persistence itself; it writes a job
//! snapshot through this trait after every attempt boundary so an external
//! substrate can replay state across restarts. [`MemoryJobStore`] is the
//! in-process implementation used by the engine and the test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::state_machine::Job;

/// Keyed get/put persistence for job snapshots.
pub trait JobStateStore: Send + Sync {
    /// Persist the snapshot, replacing any previous one for the same id.
    fn put(&self, job: Job);

    fn get(&self, id: &Uuid) -> Option<Job>;
}

/// In-memory store; snapshots live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStateStore for MemoryJobStore {
    fn put(&self, job: Job) {
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .insert(job.id, job);
    }

    fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs
            .lock()
            .expect("job store lock poisoned")
            .get(id)
            .cloned()
    }
}
