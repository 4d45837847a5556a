//! Job engine facade: the external interface callers and the durable
//! substrate talk to.
//!
//! One coordinator task per submitted job, at most one in-flight attempt
//! per job. All job state is owned by the per-job [`JobStateMachine`];
//! queries and the cancellation signal go through the engine, never at the
//! job fields directly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancellationController;
use crate::error::{ErrorKind, JobrunError};
use crate::launcher::ProcessLauncher;
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::state_machine::{ExecutionResult, Job, JobError, JobParameters, JobStateMachine, JobStatus};
use crate::store::{JobStateStore, MemoryJobStore};

struct JobEntry {
    machine: Arc<Mutex<JobStateMachine>>,
    cancel: CancellationController,
    task: Option<JoinHandle<()>>,
}

/// Runs submitted jobs and answers status queries about them.
pub struct JobEngine {
    launcher: Arc<ProcessLauncher>,
    policy: RetryPolicy,
    store: Arc<dyn JobStateStore>,
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
}

impl JobEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_store(policy, Arc::new(MemoryJobStore::new()))
    }

    /// Build an engine persisting snapshots through the given store.
    pub fn with_store(policy: RetryPolicy, store: Arc<dyn JobStateStore>) -> Self {
        Self {
            launcher: Arc::new(ProcessLauncher::new()),
            policy,
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a job and start its coordinator task. Returns the job id.
    pub async fn submit(&self, params: JobParameters) -> Result<Uuid, JobrunError> {
        params.validate()?;
        self.spawn_job(Job::new(params)).await
    }

    /// Accept a job under a caller-chosen id, tolerating substrate
    /// redelivery.
    ///
    /// The store is consulted before any launch:
    /// - a terminal snapshot is adopted as-is, nothing runs again;
    /// - a non-terminal snapshot with attempts already recorded means a
    ///   crash happened between launch and result persistence; the launch
    ///   is refused and the job surfaces a non-retryable error, because the
    ///   external process may already have run to completion;
    /// - otherwise the job runs normally.
    pub async fn submit_with_id(
        &self,
        id: Uuid,
        params: JobParameters,
    ) -> Result<Uuid, JobrunError> {
        params.validate()?;

        if let Some(snapshot) = self.store.get(&id) {
            if snapshot.status.is_terminal() {
                info!(job_id = %id, status = %snapshot.status, "adopting persisted terminal job");
                self.register(JobStateMachine::from_job(snapshot), None).await;
                return Ok(id);
            }
            if snapshot.attempts > 0 {
                warn!(job_id = %id, attempts = snapshot.attempts, "refusing ambiguous redelivery");
                let mut machine = JobStateMachine::from_job(snapshot);
                machine.record_error(JobError {
                    kind: ErrorKind::Other,
                    message: "ambiguous recovery; manual intervention required".into(),
                });
                machine.fail();
                self.store.put(machine.snapshot());
                self.register(machine, None).await;
                return Ok(id);
            }
        }

        self.spawn_job(Job::with_id(id, params)).await
    }

    async fn spawn_job(&self, job: Job) -> Result<Uuid, JobrunError> {
        let id = job.id;
        let machine = Arc::new(Mutex::new(JobStateMachine::from_job(job)));
        let cancel = CancellationController::new();

        let launcher = Arc::clone(&self.launcher);
        let store = Arc::clone(&self.store);
        let policy = self.policy.clone();
        let task_machine = Arc::clone(&machine);
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let coordinator = RetryCoordinator::new(policy);
            // Terminal outcome is recorded on the state machine; the
            // returned value only matters to direct coordinator callers.
            let _ = coordinator
                .execute(
                    launcher.as_ref(),
                    task_machine.as_ref(),
                    &task_cancel,
                    store.as_ref(),
                )
                .await;
        });

        self.jobs.lock().await.insert(
            id,
            JobEntry {
                machine,
                cancel,
                task: Some(task),
            },
        );
        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    async fn register(&self, machine: JobStateMachine, task: Option<JoinHandle<()>>) {
        let id = machine.id();
        self.jobs.lock().await.insert(
            id,
            JobEntry {
                machine: Arc::new(Mutex::new(machine)),
                cancel: CancellationController::new(),
                task,
            },
        );
    }

    async fn machine(&self, id: &Uuid) -> Option<Arc<Mutex<JobStateMachine>>> {
        self.jobs.lock().await.get(id).map(|e| Arc::clone(&e.machine))
    }

    pub async fn status(&self, id: &Uuid) -> Option<JobStatus> {
        let machine = self.machine(id).await?;
        let status = machine.lock().await.status();
        Some(status)
    }

    pub async fn result(&self, id: &Uuid) -> Option<ExecutionResult> {
        let machine = self.machine(id).await?;
        let result = machine.lock().await.result().cloned();
        result
    }

    pub async fn attempts(&self, id: &Uuid) -> Option<u32> {
        let machine = self.machine(id).await?;
        let attempts = machine.lock().await.attempts();
        Some(attempts)
    }

    pub async fn last_error(&self, id: &Uuid) -> Option<JobError> {
        let machine = self.machine(id).await?;
        let error = machine.lock().await.last_error().cloned();
        error
    }

    /// Clone of the full job record, for reporting.
    pub async fn snapshot(&self, id: &Uuid) -> Option<Job> {
        let machine = self.machine(id).await?;
        let snapshot = machine.lock().await.snapshot();
        Some(snapshot)
    }

    /// Fire-and-forget cancellation signal. Idempotent; returns whether the
    /// job id was known.
    pub async fn request_cancellation(&self, id: &Uuid) -> bool {
        let (machine, cancel) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(id) {
                Some(entry) => (Arc::clone(&entry.machine), entry.cancel.clone()),
                None => return false,
            }
        };
        machine.lock().await.request_cancellation();
        cancel.request_cancellation();
        info!(job_id = %id, "cancellation requested");
        true
    }

    /// Await the job's coordinator task. Returns immediately for jobs that
    /// already reached a terminal status.
    pub async fn wait(&self, id: &Uuid) {
        let task = {
            let mut jobs = self.jobs.lock().await;
            jobs.get_mut(id).and_then(|entry| entry.task.take())
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(job_id = %id, error = %err, "coordinator task failed");
            }
        }
    }
}
