//! Retry policy and the coordinator that drives repeated launch attempts.
//!
//! The coordinator owns classification: the launcher reports one failure
//! per attempt, and only the coordinator decides whether another attempt
//! is scheduled. Application-level failure (a nonzero exit code) is a
//! completed result and is never retried; only infrastructure failures
//! (timeouts, launch errors) go through the backoff loop.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancellationController;
use crate::error::{ErrorKind, LaunchError};
use crate::launcher::Launcher;
use crate::state_machine::{ExecutionResult, JobError, JobStateMachine, JobStatus};
use crate::store::JobStateStore;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of launch attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap applied to every computed backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive backoffs. At least 1.
    pub backoff_multiplier: u32,
    /// Error kinds that fail the job without another attempt.
    pub non_retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2,
            non_retryable: HashSet::from([ErrorKind::NotFound, ErrorKind::Cancelled]),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given attempt number (1-based):
    /// `min(max, initial * multiplier^(attempt - 1))`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier).saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn is_non_retryable(&self, kind: ErrorKind) -> bool {
        self.non_retryable.contains(&kind)
    }
}

/// Drives launch attempts for one job until a terminal outcome.
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run the job to a terminal status, mutating it only through the state
    /// machine and persisting a snapshot after every attempt boundary.
    pub async fn execute<L: Launcher>(
        &self,
        launcher: &L,
        machine: &Mutex<JobStateMachine>,
        cancel: &CancellationController,
        store: &dyn JobStateStore,
    ) -> Result<ExecutionResult, LaunchError> {
        let (job_id, params) = {
            let mut m = machine.lock().await;
            m.start();
            if m.status() == JobStatus::Cancelled {
                store.put(m.snapshot());
                return Err(LaunchError::Cancelled);
            }
            (m.id(), m.params().clone())
        };

        let mut attempt: u32 = 1;
        loop {
            // Cancellation wins at the attempt boundary: no further launch.
            if cancel.is_cancellation_requested() {
                let mut m = machine.lock().await;
                m.cancel();
                store.put(m.snapshot());
                info!(job_id = %job_id, "job cancelled before attempt {attempt}");
                return Err(LaunchError::Cancelled);
            }

            {
                let mut m = machine.lock().await;
                m.begin_attempt();
            }
            info!(
                job_id = %job_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                "launching attempt"
            );

            match launcher.launch(&params, cancel).await {
                Ok(result) => {
                    let mut m = machine.lock().await;
                    m.complete(result.clone());
                    store.put(m.snapshot());
                    info!(
                        job_id = %job_id,
                        attempt,
                        exit_code = result.exit_code,
                        duration_ms = result.duration_ms,
                        "job completed"
                    );
                    return Ok(result);
                }
                Err(err) => {
                    let kind = err.kind();
                    warn!(job_id = %job_id, attempt, error = %err, "attempt failed");
                    {
                        let mut m = machine.lock().await;
                        m.record_error(JobError::from_launch(&err));
                    }

                    if kind == ErrorKind::Cancelled {
                        let mut m = machine.lock().await;
                        m.cancel();
                        store.put(m.snapshot());
                        return Err(err);
                    }

                    if self.policy.is_non_retryable(kind) || attempt >= self.policy.max_attempts {
                        let mut m = machine.lock().await;
                        m.fail();
                        store.put(m.snapshot());
                        return Err(err);
                    }

                    {
                        let m = machine.lock().await;
                        store.put(m.snapshot());
                    }

                    let backoff = self.policy.backoff_for_attempt(attempt);
                    debug!(
                        job_id = %job_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "waiting before retry"
                    );
                    // A cancellation request during the wait aborts it
                    // immediately rather than completing the sleep.
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            let mut m = machine.lock().await;
                            m.cancel();
                            store.put(m.snapshot());
                            return Err(LaunchError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobParameters;
    use crate::store::MemoryJobStore;
    use chrono::Utc;
    use std::collections::VecDeque;

    /// Scripted outcome for one launch attempt.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Exit(i32),
        Fail(ErrorKind),
    }

    struct ScriptedLauncher {
        steps: std::sync::Mutex<VecDeque<Step>>,
    }

    impl ScriptedLauncher {
        fn new<I: IntoIterator<Item = Step>>(steps: I) -> Self {
            Self {
                steps: std::sync::Mutex::new(steps.into_iter().collect()),
            }
        }
    }

    impl Launcher for ScriptedLauncher {
        async fn launch(
            &self,
            _params: &JobParameters,
            _cancel: &CancellationController,
        ) -> Result<ExecutionResult, LaunchError> {
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("launcher invoked more times than scripted");
            match step {
                Step::Exit(code) => {
                    let now = Utc::now();
                    Ok(ExecutionResult {
                        exit_code: code,
                        stdout: vec![],
                        stderr: vec![],
                        duration_ms: 1,
                        started_at: now,
                        finished_at: now,
                    })
                }
                Step::Fail(kind) => Err(match kind {
                    ErrorKind::NotFound => LaunchError::ExecutableNotFound("/missing".into()),
                    ErrorKind::LaunchFailure => LaunchError::Spawn("permission denied".into()),
                    ErrorKind::Timeout => LaunchError::Timeout(Duration::from_secs(1)),
                    ErrorKind::Cancelled => LaunchError::Cancelled,
                    ErrorKind::Other => LaunchError::Other("unclassified".into()),
                }),
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            backoff_multiplier: 2,
            ..Default::default()
        }
    }

    fn machine() -> Mutex<JobStateMachine> {
        Mutex::new(JobStateMachine::new(
            JobParameters::new("/bin/true").with_timeout_secs(1),
        ))
    }

    #[test]
    fn backoff_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(5_000));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(20_000));
        assert!(policy.is_non_retryable(ErrorKind::NotFound));
        assert!(policy.is_non_retryable(ErrorKind::Cancelled));
        assert!(!policy.is_non_retryable(ErrorKind::Timeout));
        assert!(!policy.is_non_retryable(ErrorKind::LaunchFailure));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 3,
            ..Default::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let backoff = policy.backoff_for_attempt(attempt);
            assert!(backoff >= previous, "backoff shrank at attempt {attempt}");
            assert!(backoff <= Duration::from_millis(1_000));
            previous = backoff;
        }
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_multiplier_one_is_constant() {
        let policy = RetryPolicy {
            initial_backoff_ms: 250,
            backoff_multiplier: 1,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_for_attempt(7), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let launcher = ScriptedLauncher::new([Step::Exit(0)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let result = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap();

        assert!(result.is_success());
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Completed);
        assert_eq!(m.attempts(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_completes_without_retry() {
        let launcher = ScriptedLauncher::new([Step::Exit(3)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let result = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.is_success());
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Completed);
        assert_eq!(m.attempts(), 1);
    }

    #[tokio::test]
    async fn not_found_fails_after_single_attempt() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::NotFound)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let err = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Error);
        assert_eq!(m.attempts(), 1);
        assert_eq!(m.last_error().unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn timeouts_retry_until_attempts_exhaust() {
        let launcher = ScriptedLauncher::new([
            Step::Fail(ErrorKind::Timeout),
            Step::Fail(ErrorKind::Timeout),
            Step::Fail(ErrorKind::Timeout),
        ]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let err = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Error);
        assert_eq!(m.attempts(), 3);
        assert_eq!(m.last_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::Timeout), Step::Exit(0)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let result = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap();

        assert!(result.is_success());
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Completed);
        assert_eq!(m.attempts(), 2);
        // Diagnostic record of the transient failure is preserved.
        assert_eq!(m.last_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn launch_failure_can_be_made_non_retryable() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::LaunchFailure)]);
        let machine = machine();
        let mut policy = fast_policy(5);
        policy.non_retryable.insert(ErrorKind::LaunchFailure);
        let coordinator = RetryCoordinator::new(policy);
        let store = MemoryJobStore::new();

        let err = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LaunchFailure);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Error);
        assert_eq!(m.attempts(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_start_skips_all_attempts() {
        let launcher = ScriptedLauncher::new(std::iter::empty());
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let cancel = CancellationController::new();
        cancel.request_cancellation();
        let store = MemoryJobStore::new();

        {
            machine.lock().await.request_cancellation();
        }
        let err = coordinator
            .execute(&launcher, &machine, &cancel, &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Cancelled);
        assert_eq!(m.attempts(), 0);
        assert!(m.result().is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_attempt_is_terminal() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::Cancelled)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        let err = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Cancelled);
        assert_eq!(m.attempts(), 1);
        assert!(m.result().is_none());
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts_the_wait() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::Timeout)]);
        let machine = machine();
        // Long enough that the test would hang if the sleep ran to completion.
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2,
            ..Default::default()
        };
        let coordinator = RetryCoordinator::new(policy);
        let cancel = CancellationController::new();
        let store = MemoryJobStore::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.request_cancellation();
        });

        let start = std::time::Instant::now();
        let err = coordinator
            .execute(&launcher, &machine, &cancel, &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Cancelled);
        assert_eq!(m.attempts(), 1);
    }

    #[tokio::test]
    async fn unclassified_errors_retry_conservatively() {
        let launcher = ScriptedLauncher::new([
            Step::Fail(ErrorKind::Other),
            Step::Fail(ErrorKind::Other),
        ]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(2));
        let store = MemoryJobStore::new();

        let err = coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Other);
        let m = machine.lock().await;
        assert_eq!(m.status(), JobStatus::Error);
        assert_eq!(m.attempts(), 2);
    }

    #[tokio::test]
    async fn snapshots_are_persisted_at_attempt_boundaries() {
        let launcher = ScriptedLauncher::new([Step::Fail(ErrorKind::Timeout), Step::Exit(0)]);
        let machine = machine();
        let coordinator = RetryCoordinator::new(fast_policy(3));
        let store = MemoryJobStore::new();

        coordinator
            .execute(&launcher, &machine, &CancellationController::new(), &store)
            .await
            .unwrap();

        let id = machine.lock().await.id();
        let snap = store.get(&id).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.attempts, 2);
    }
}
