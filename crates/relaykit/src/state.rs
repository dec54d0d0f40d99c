//! Cooperative cancel/pause state shared between an owner and its workers.
//!
//! The owner holds a [`ProcessState`] and hands [`ProcessStateToken`]s to the
//! workers it starts. Two gates drive pausing:
//! - the running gate, closed by `request_pause` and reopened by `resume`
//! - the paused gate, opened by a worker once it has parked at a checkpoint
//!
//! Cancellation is one-way and wakes every parked worker.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
pub use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Observable phase of a [`ProcessState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPhase {
    Running,
    /// Running gate closed, no worker has parked yet.
    PauseRequested,
    Paused,
    /// Terminal.
    Cancelled,
}

impl ProcessPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

struct Gates {
    cancel: CancellationToken,
    running: watch::Sender<bool>,
    paused: watch::Sender<bool>,
}

impl Gates {
    fn new(cancel: CancellationToken) -> Self {
        let (running, _) = watch::channel(true);
        let (paused, _) = watch::channel(false);
        Self {
            cancel,
            running,
            paused,
        }
    }

    fn resume(&self) {
        self.running.send_replace(true);
        self.paused.send_replace(false);
    }

    fn phase(&self) -> ProcessPhase {
        if self.cancel.is_cancelled() {
            return ProcessPhase::Cancelled;
        }
        match (*self.running.borrow(), *self.paused.borrow()) {
            (true, _) => ProcessPhase::Running,
            (false, false) => ProcessPhase::PauseRequested,
            (false, true) => ProcessPhase::Paused,
        }
    }
}

/// Reopens the running gate when a pause request ends unacknowledged,
/// including when the request future is dropped.
struct PendingPause<'a> {
    gates: &'a Gates,
    acknowledged: bool,
}

impl Drop for PendingPause<'_> {
    fn drop(&mut self) {
        if !self.acknowledged {
            self.gates.resume();
        }
    }
}

/// Owner side: requests cancel, pause and resume.
pub struct ProcessState {
    gates: Arc<Gates>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Build a state whose cancel flag is driven by an existing token.
    ///
    /// Pass `parent.child_token()` to have an outer scope cancel this state
    /// without this state being able to cancel the outer scope.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            gates: Arc::new(Gates::new(cancel)),
        }
    }

    /// Read-only view handed to workers.
    pub fn token(&self) -> ProcessStateToken {
        ProcessStateToken {
            gates: Arc::clone(&self.gates),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.gates.cancel.clone()
    }

    /// Idempotent. Wakes every worker parked in a checkpoint.
    pub fn request_cancel(&self) {
        if !self.gates.cancel.is_cancelled() {
            tracing::debug!("Cancel requested");
        }
        self.gates.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.gates.cancel.is_cancelled()
    }

    /// Close the running gate and wait up to `timeout` for a worker to park.
    ///
    /// Returns `false` and reopens the running gate if no worker acknowledged
    /// in time, or if the state is (or becomes) cancelled.
    ///
    /// Cancel-safe: dropping the future before a worker acknowledged also
    /// reopens the running gate.
    pub async fn request_pause(&self, timeout: Duration) -> bool {
        if self.gates.cancel.is_cancelled() {
            return false;
        }

        self.gates.running.send_replace(false);
        let mut pending = PendingPause {
            gates: &self.gates,
            acknowledged: false,
        };
        let mut paused = self.gates.paused.subscribe();

        let acknowledged = tokio::select! {
            biased;
            _ = self.gates.cancel.cancelled() => false,
            result = tokio::time::timeout(timeout, paused.wait_for(|p| *p)) => {
                matches!(result, Ok(Ok(_)))
            }
        };

        if acknowledged {
            tracing::debug!("Pause acknowledged");
        } else {
            tracing::warn!(timeout = ?timeout, "Pause not acknowledged - resuming");
        }
        pending.acknowledged = acknowledged;
        acknowledged
    }

    /// Reopen the running gate and clear the acknowledgement.
    pub fn resume(&self) {
        self.gates.resume();
    }

    pub fn phase(&self) -> ProcessPhase {
        self.gates.phase()
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side: observes cancel and pause requests.
#[derive(Clone)]
pub struct ProcessStateToken {
    gates: Arc<Gates>,
}

impl ProcessStateToken {
    pub fn is_cancellation_requested(&self) -> bool {
        self.gates.cancel.is_cancelled()
    }

    pub fn throw_if_cancellation_requested(&self) -> Result<()> {
        if self.is_cancellation_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_pause_requested(&self) -> bool {
        !*self.gates.running.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.gates.cancel.cancelled().await;
    }

    /// Resolves once the running gate is closed.
    pub async fn pause_requested(&self) {
        let mut running = self.gates.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.gates.cancel.clone()
    }

    /// Signal "paused" and park until resumed.
    ///
    /// Returns `true` when resumed, `false` if cancellation was already
    /// requested or fires while parked.
    pub async fn acknowledge_pause_and_wait(&self) -> bool {
        if self.gates.cancel.is_cancelled() {
            return false;
        }

        let mut running = self.gates.running.subscribe();
        let resumed = loop {
            if *running.borrow_and_update() {
                break true;
            }
            // Re-acknowledge on every wake: a resume immediately followed by a
            // new pause request is seen here only as a gate change.
            self.gates.paused.send_replace(true);
            tokio::select! {
                biased;
                _ = self.gates.cancel.cancelled() => break false,
                changed = running.changed() => {
                    if changed.is_err() {
                        break false;
                    }
                }
            }
        };

        self.gates.paused.send_replace(false);
        resumed
    }

    /// Safe point for long-running work: parks if a pause is pending, then
    /// fails with [`Error::Cancelled`] if cancellation was requested.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_pause_requested() {
            self.acknowledge_pause_and_wait().await;
        }
        self.throw_if_cancellation_requested()
    }

    pub fn phase(&self) -> ProcessPhase {
        self.gates.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_state_is_running() {
        let state = ProcessState::new();
        assert_eq!(state.phase(), ProcessPhase::Running);
        assert!(!state.token().is_pause_requested());
        assert!(state.token().throw_if_cancellation_requested().is_ok());
    }

    #[test]
    fn phase_serializes_snake_case() {
        insta::assert_json_snapshot!(
            [
                ProcessPhase::Running,
                ProcessPhase::PauseRequested,
                ProcessPhase::Paused,
                ProcessPhase::Cancelled,
            ],
            @r#"
        [
          "running",
          "pause_requested",
          "paused",
          "cancelled"
        ]
        "#
        );
    }

    #[test]
    fn cancel_is_monotonic() {
        let state = ProcessState::new();
        let token = state.token();

        state.request_cancel();
        state.request_cancel();
        state.resume();

        assert!(state.is_cancel_requested());
        assert!(token.is_cancellation_requested());
        assert_eq!(token.throw_if_cancellation_requested(), Err(Error::Cancelled));
        assert_eq!(state.phase(), ProcessPhase::Cancelled);
        assert!(state.phase().is_terminal());
    }

    #[tokio::test]
    async fn acknowledge_returns_false_when_cancelled() {
        let state = ProcessState::new();
        state.request_cancel();
        assert!(!state.token().acknowledge_pause_and_wait().await);
    }

    #[tokio::test]
    async fn pause_on_cancelled_state_is_rejected() {
        let state = ProcessState::new();
        state.request_cancel();
        assert!(!state.request_pause(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn pause_times_out_without_checkpoint() {
        let state = ProcessState::new();

        let acknowledged = state.request_pause(Duration::from_millis(20)).await;

        assert!(!acknowledged);
        assert_eq!(state.phase(), ProcessPhase::Running);
        assert!(!state.token().is_pause_requested());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_resume_round_trip() {
        let state = ProcessState::new();
        let token = state.token();
        let ticks = Arc::new(AtomicUsize::new(0));

        let worker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                while token.checkpoint().await.is_ok() {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        assert!(state.request_pause(Duration::from_secs(5)).await);
        assert_eq!(state.phase(), ProcessPhase::Paused);

        let frozen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);

        state.resume();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ticks.load(Ordering::SeqCst) > frozen);

        state.request_cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_wakes_parked_worker() {
        let state = ProcessState::new();
        let token = state.token();

        let parked = tokio::spawn(async move { token.acknowledge_pause_and_wait().await });

        assert!(state.request_pause(Duration::from_secs(5)).await);
        state.request_cancel();

        assert!(!parked.await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_pause_request_reopens_gate() {
        let state = ProcessState::new();

        let pause = state.request_pause(Duration::from_secs(60));
        let result = tokio::time::timeout(Duration::from_millis(10), pause).await;
        assert!(result.is_err());

        assert_eq!(state.phase(), ProcessPhase::Running);
        assert!(!state.token().is_pause_requested());
    }

    #[tokio::test]
    async fn parked_worker_acknowledges_back_to_back_pause() {
        let state = ProcessState::new();
        let token = state.token();

        let parked = tokio::spawn(async move { token.acknowledge_pause_and_wait().await });
        assert!(state.request_pause(Duration::from_secs(5)).await);

        // The worker is not polled between these two calls.
        state.resume();
        assert!(state.request_pause(Duration::from_secs(1)).await);
        assert_eq!(state.phase(), ProcessPhase::Paused);

        state.request_cancel();
        assert!(!parked.await.unwrap());
    }

    #[tokio::test]
    async fn parent_token_cancels_child_state() {
        let parent = CancellationToken::new();
        let state = ProcessState::with_cancellation(parent.child_token());

        parent.cancel();

        assert!(state.is_cancel_requested());
        state.token().cancelled().await;
    }
}
