//! Completion handle - lifecycle plumbing for a background unit of work.
//!
//! A handle is created together with the work it tracks. It owns the work's
//! cancellation token and a completion signal, and lets callers:
//! - link the token to other tokens or other handles
//! - schedule an expiry
//! - observe cancellation and completion via callbacks
//!
//! Dropping a handle never cancels the work. Only [`CompletionHandle::stop`]
//! (or a linked trigger) does.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::panic_message;

/// How a tracked unit of work ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
    /// The work ended after its token fired, or was aborted by the runtime.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

struct Shared {
    id: Uuid,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<Outcome>>,
}

impl Shared {
    fn finish(&self, outcome: Outcome) {
        tracing::debug!(handle = %self.id, outcome = ?outcome, "Work finished");
        self.outcome.send_replace(Some(outcome));
    }

    fn current(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    async fn finished(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Outcome::Cancelled),
            // Unreachable while `self` keeps the sender alive.
            Err(_) => Outcome::Cancelled,
        }
    }
}

/// Handle to a running background operation.
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

impl CompletionHandle {
    /// Start `work` on the tokio runtime and return its handle.
    ///
    /// `work` receives the handle's cancellation token and is expected to
    /// observe it cooperatively. An `Err` or a panic becomes
    /// [`Outcome::Failed`], even after the token fired; an `Ok` returned
    /// after the token fired becomes [`Outcome::Cancelled`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F, Fut, E>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            cancel: cancel.clone(),
            outcome,
        });

        let task = tokio::spawn(work(cancel));

        let watcher = Arc::clone(&shared);
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(())) if watcher.cancel.is_cancelled() => Outcome::Cancelled,
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    tracing::error!(handle = %watcher.id, panic = %message, "Work panicked");
                    Outcome::Failed(format!("panicked: {message}"))
                }
                Err(_) => Outcome::Cancelled,
            };
            watcher.finish(outcome);
        });

        tracing::debug!(handle = %shared.id, "Work started");
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Cancel this handle when `external` fires. One-directional.
    pub fn link_with(&self, external: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let external = external.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = external.cancelled() => {
                    tracing::debug!(handle = %shared.id, "Linked token fired");
                    shared.cancel.cancel();
                }
                _ = shared.finished() => {}
            }
        });
    }

    /// Cancel this handle once `other` finishes, however it ends.
    pub fn after(&self, other: &CompletionHandle) {
        self.after_any(&[other]);
    }

    /// Cancel this handle once the first of `others` finishes.
    ///
    /// An empty slice registers nothing.
    pub fn after_any(&self, others: &[&CompletionHandle]) {
        if others.is_empty() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let others: Vec<Arc<Shared>> = others.iter().map(|h| Arc::clone(&h.shared)).collect();
        tokio::spawn(async move {
            let waits = others.iter().map(|o| Box::pin(o.finished()));
            tokio::select! {
                (_, index, _) = select_all(waits) => {
                    tracing::debug!(
                        handle = %shared.id,
                        predecessor = %others[index].id,
                        "Predecessor finished - cancelling"
                    );
                    shared.cancel.cancel();
                }
                _ = shared.finished() => {}
            }
        });
    }

    /// Cancel this handle after `duration` unless the work finishes first.
    pub fn expire_in(&self, duration: Duration) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    tracing::debug!(handle = %shared.id, after = ?duration, "Expired");
                    shared.cancel.cancel();
                }
                _ = shared.finished() => {}
            }
        });
    }

    /// Run `callback` once if this handle is cancelled before the work ends.
    pub fn when_cancelled<C>(&self, callback: C)
    where
        C: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // A stop after the work already ended does not count.
            let cancelled = match shared.current() {
                Some(outcome) => outcome == Outcome::Cancelled,
                None => tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => {
                        matches!(shared.current(), None | Some(Outcome::Cancelled))
                    }
                    outcome = shared.finished() => outcome == Outcome::Cancelled,
                },
            };
            if cancelled {
                callback();
            }
        });
    }

    /// Run `callback` once with the outcome when the work ends.
    pub fn when_finished<C>(&self, callback: C)
    where
        C: FnOnce(Outcome) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            callback(shared.finished().await);
        });
    }

    /// Request cancellation. Idempotent.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.current()
    }

    pub async fn wait(&self) -> Outcome {
        self.shared.finished().await
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Outcome>> {
        self.shared.outcome.subscribe()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.shared.id)
            .field("cancelled", &self.is_cancelled())
            .field("outcome", &self.shared.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn until_cancelled() -> CompletionHandle {
        CompletionHandle::spawn(|token| async move {
            token.cancelled().await;
            Ok::<_, Infallible>(())
        })
    }

    #[tokio::test]
    async fn finished_work_succeeds() {
        let handle = CompletionHandle::spawn(|_| async { Ok::<_, Infallible>(()) });

        assert_eq!(handle.wait().await, Outcome::Succeeded);
        assert!(handle.is_finished());
        assert!(handle.outcome().unwrap().is_success());
    }

    #[tokio::test]
    async fn failed_work_reports_error() {
        let handle = CompletionHandle::spawn(|_| async { Err("disk full") });

        let outcome = handle.wait().await;
        assert_eq!(outcome, Outcome::Failed("disk full".to_string()));
        assert_eq!(outcome.error(), Some("disk full"));
    }

    #[tokio::test]
    async fn panicking_work_is_failed() {
        let handle = CompletionHandle::spawn(|_| async {
            if true {
                panic!("exploded");
            }
            Ok::<_, Infallible>(())
        });

        match handle.wait().await {
            Outcome::Failed(message) => assert!(message.contains("exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_after_stop_is_still_failed() {
        let handle = CompletionHandle::spawn(|token| async move {
            token.cancelled().await;
            Err("disk full")
        });

        handle.stop();

        assert_eq!(handle.wait().await, Outcome::Failed("disk full".to_string()));
        assert!(handle.is_cancelled());
    }

    #[test]
    #[should_panic]
    fn spawn_outside_runtime_panics() {
        let _ = CompletionHandle::spawn(|_| async { Ok::<_, Infallible>(()) });
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels() {
        let handle = until_cancelled();
        assert!(!handle.is_finished());

        handle.stop();
        handle.stop();

        assert_eq!(handle.wait().await, Outcome::Cancelled);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn expire_in_cancels_after_duration() {
        let handle = until_cancelled();
        handle.expire_in(Duration::from_millis(20));

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn link_with_is_one_directional() {
        let external = CancellationToken::new();
        let handle = until_cancelled();
        handle.link_with(&external);

        handle.stop();
        handle.wait().await;
        assert!(!external.is_cancelled());

        let external = CancellationToken::new();
        let handle = until_cancelled();
        handle.link_with(&external);
        external.cancel();
        assert_eq!(handle.wait().await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn after_cancels_when_other_finishes() {
        let first = CompletionHandle::spawn(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err("first failed")
        });
        let second = until_cancelled();
        second.after(&first);

        assert_eq!(second.wait().await, Outcome::Cancelled);
        assert!(first.is_finished());
    }

    #[tokio::test]
    async fn after_any_fires_on_first() {
        let slow = until_cancelled();
        let fast = CompletionHandle::spawn(|_| async { Ok::<_, Infallible>(()) });
        let follower = until_cancelled();
        follower.after_any(&[&slow, &fast]);

        assert_eq!(follower.wait().await, Outcome::Cancelled);
        assert!(!slow.is_finished());
        slow.stop();
    }

    #[tokio::test]
    async fn when_cancelled_fires_once_on_stop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = until_cancelled();

        let counter = Arc::clone(&fired);
        handle.when_cancelled(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.stop();
        handle.stop();
        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn when_cancelled_skipped_on_success() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = CompletionHandle::spawn(|_| async { Ok::<_, Infallible>(()) });

        let counter = Arc::clone(&fired);
        handle.when_cancelled(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn when_cancelled_ignores_stop_after_success() {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = CompletionHandle::spawn(|_| async { Ok::<_, Infallible>(()) });
        assert_eq!(handle.wait().await, Outcome::Succeeded);

        let counter = Arc::clone(&fired);
        handle.when_cancelled(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Before the observer task is first polled.
        handle.stop();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(handle.outcome(), Some(Outcome::Succeeded));
    }

    #[tokio::test]
    async fn when_finished_receives_outcome() {
        let (tx, rx) = oneshot::channel();
        let handle = CompletionHandle::spawn(|_| async { Err("nope") });
        handle.when_finished(move |outcome| {
            let _ = tx.send(outcome);
        });

        assert_eq!(rx.await.unwrap(), Outcome::Failed("nope".to_string()));
    }

    #[tokio::test]
    async fn drop_does_not_cancel_work() {
        let (tx, rx) = oneshot::channel();
        let handle = CompletionHandle::spawn(|token| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(token.is_cancelled());
            Ok::<_, Infallible>(())
        });
        drop(handle);

        assert!(!rx.await.unwrap());
    }
}
