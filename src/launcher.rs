//! Process launching with stream capture and the timeout/cancellation race.
//!
//! [`ProcessLauncher`] performs exactly one OS-level invocation per call:
//! pre-flight checks, spawn, concurrent line capture of the requested
//! streams, and a three-way race between natural exit, the attempt timeout,
//! and the shared cancellation flag. Retry decisions live in the
//! coordinator, never here.

use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancellationController;
use crate::error::LaunchError;
use crate::state_machine::{ExecutionResult, JobParameters};

/// Grace period between SIGTERM and SIGKILL when tearing a process tree down.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bound on waiting for the output readers after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Seam for substituting the real launcher in coordinator tests.
pub trait Launcher {
    async fn launch(
        &self,
        params: &JobParameters,
        cancel: &CancellationController,
    ) -> Result<ExecutionResult, LaunchError>;
}

/// Launches one attempt of an external process.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

enum RaceOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        params: &JobParameters,
        cancel: &CancellationController,
    ) -> Result<ExecutionResult, LaunchError> {
        // Pre-flight runs fresh on every attempt; a transient filesystem
        // issue on one attempt must not memoize across attempts.
        if !params.program.is_file() {
            return Err(LaunchError::ExecutableNotFound(params.program.clone()));
        }
        if let Some(dir) = &params.working_dir
            && !dir.is_dir()
        {
            return Err(LaunchError::WorkingDirNotFound(dir.clone()));
        }

        let mut cmd = Command::new(&params.program);
        cmd.args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(if params.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if params.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so the whole tree can be signalled as a unit.
        #[cfg(unix)]
        cmd.process_group(0);

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::ExecutableNotFound(params.program.clone())
            } else {
                LaunchError::Spawn(e.to_string())
            }
        })?;

        debug!(
            program = %params.program.display(),
            pid = child.id(),
            timeout_secs = params.timeout_secs,
            "spawned process"
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_lines(out)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_lines(err)));

        let timeout = params.timeout();
        let outcome = tokio::select! {
            res = child.wait() => match res {
                Ok(status) => RaceOutcome::Exited(status),
                Err(e) => RaceOutcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => {
                // The process may have exited in the same instant the timer
                // fired; prefer the race-free exit status over a kill.
                match child.try_wait() {
                    Ok(Some(status)) => RaceOutcome::Exited(status),
                    _ => {
                        warn!(pid = child.id(), timeout_secs = params.timeout_secs, "attempt timed out; killing process tree");
                        terminate_tree(&mut child).await;
                        RaceOutcome::TimedOut
                    }
                }
            }
            _ = cancel.cancelled() => {
                match child.try_wait() {
                    Ok(Some(status)) => RaceOutcome::Exited(status),
                    _ => {
                        debug!(pid = child.id(), "cancellation requested; killing process tree");
                        terminate_tree(&mut child).await;
                        RaceOutcome::Cancelled
                    }
                }
            }
        };

        // The readers are joined before a result is constructed, so no
        // trailing output between exit and pipe flush is lost.
        let stdout = drain(stdout_task, "stdout").await;
        let stderr = drain(stderr_task, "stderr").await;

        let finished_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            RaceOutcome::Exited(status) => {
                // A signal-terminated process reports no code; record -1.
                let exit_code = status.code().unwrap_or(-1);
                debug!(exit_code, duration_ms, "process exited");
                Ok(ExecutionResult {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    started_at,
                    finished_at,
                })
            }
            RaceOutcome::TimedOut => Err(LaunchError::Timeout(timeout)),
            RaceOutcome::Cancelled => Err(LaunchError::Cancelled),
            RaceOutcome::WaitFailed(e) => {
                Err(LaunchError::Other(format!("failed waiting on process: {e}")))
            }
        }
    }
}

/// Accumulate a captured stream as ordered lines until EOF.
async fn read_lines<R>(reader: R) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => out.push(line),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "output stream read failed");
                break;
            }
        }
    }
    out
}

/// Join a reader task, bounded by [`DRAIN_TIMEOUT`].
async fn drain(task: Option<JoinHandle<Vec<String>>>, stream: &str) -> Vec<String> {
    let Some(handle) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output reader task failed");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Terminate the process and all of its descendants.
///
/// SIGTERM to the process group first, then SIGKILL after [`KILL_GRACE`].
/// Errors are logged and swallowed; killing an already-dead process must
/// not fail the attempt.
#[cfg(unix)]
async fn terminate_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    // process_group(0) made the child the leader of its own group.
    let pgid = Pid::from_raw(pid as i32);

    if let Err(err) = killpg(pgid, Signal::SIGTERM) {
        warn!(pid, error = %err, "failed to SIGTERM process group");
    }

    tokio::select! {
        _ = tokio::time::sleep(KILL_GRACE) => {
            if let Err(err) = killpg(pgid, Signal::SIGKILL) {
                warn!(pid, error = %err, "failed to SIGKILL process group");
            }
            if let Err(err) = child.wait().await {
                warn!(pid, error = %err, "failed to reap killed process");
            }
        }
        _ = child.wait() => {}
    }
}

#[cfg(not(unix))]
async fn terminate_tree(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> JobParameters {
        JobParameters::new("/bin/sh")
            .with_args(["-c", script])
            .with_timeout_secs(30)
    }

    #[tokio::test]
    async fn captures_ordered_stdout_lines() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = sh("printf 'A\\n'; sleep 0.1; printf 'B\\n'");
        let result = launcher.launch(&params, &cancel).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(result.is_success());
        assert_eq!(result.stdout_text(), "A\nB");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let result = launcher.launch(&sh("exit 3"), &cancel).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let result = launcher
            .launch(&sh("echo out; echo oops >&2"), &cancel)
            .await
            .unwrap();
        assert_eq!(result.stdout_text(), "out");
        assert_eq!(result.stderr_text(), "oops");
    }

    #[tokio::test]
    async fn capture_can_be_disabled_per_stream() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let mut params = sh("echo visible; echo hidden >&2");
        params.capture_stderr = false;
        let result = launcher.launch(&params, &cancel).await.unwrap();
        assert_eq!(result.stdout_text(), "visible");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn missing_executable_fails_preflight() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = JobParameters::new("/no/such/binary").with_timeout_secs(5);
        let err = launcher.launch(&params, &cancel).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn missing_working_dir_fails_preflight() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = sh("true").with_working_dir("/no/such/dir");
        let err = launcher.launch(&params, &cancel).await.unwrap_err();
        assert!(matches!(err, LaunchError::WorkingDirNotFound(_)));
    }

    #[tokio::test]
    async fn working_dir_is_honored() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();
        let dir = TempDir::new().unwrap();
        let canonical = dir.path().canonicalize().unwrap();

        let params = sh("pwd").with_working_dir(dir.path());
        let result = launcher.launch(&params, &cancel).await.unwrap();
        assert_eq!(result.stdout_text(), canonical.display().to_string());
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = sh("printf '%s' \"$JOBRUN_TEST_VALUE\"")
            .with_env("JOBRUN_TEST_VALUE", "forty-two");
        let result = launcher.launch(&params, &cancel).await.unwrap();
        assert_eq!(result.stdout_text(), "forty-two");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = sh("sleep 5").with_timeout_secs(1);
        let start = Instant::now();
        let err = launcher.launch(&params, &cancel).await.unwrap_err();

        assert!(matches!(err, LaunchError::Timeout(_)));
        // Killed well before the sleep would have finished.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.request_cancellation();
        });

        let params = sh("sleep 10").with_timeout_secs(30);
        let start = Instant::now();
        let err = launcher.launch(&params, &cancel).await.unwrap_err();

        assert!(matches!(err, LaunchError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_before_timeout_is_drained() {
        let launcher = ProcessLauncher::new();
        let cancel = CancellationController::new();

        let params = sh("echo partial; sleep 5").with_timeout_secs(1);
        let err = launcher.launch(&params, &cancel).await.unwrap_err();
        // The attempt still fails; partial output is not part of a result.
        assert!(matches!(err, LaunchError::Timeout(_)));
    }
}
