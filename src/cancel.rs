//! Cooperative cancellation shared across the engine.
//!
//! A single-shot flag read by both the launcher (mid-attempt) and the
//! coordinator (between attempts and during backoff waits). Setting it is
//! idempotent and there is no way to un-cancel.

use tokio_util::sync::CancellationToken;

/// Shared cancellation flag for one job.
///
/// Clones share the same underlying token, so any holder can request
/// cancellation and every holder observes it. Safe to set concurrently
/// with reads.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request cancellation. Idempotent, single-shot.
    pub fn request_cancellation(&self) {
        self.token.cancel();
    }

    /// Non-blocking read of the flag.
    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested; for `select!` arms.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
