//! Single-slot feedback channel between one producer and one consumer.
//!
//! The producer is started immediately with a [`Pusher`]. Each push takes the
//! channel's only permit and parks the value in the slot; the consumer frees
//! the permit when it reads. The producer is therefore never more than one
//! value ahead of the consumer.
//!
//! The channel finishes when the producer's future completes. Aborting only
//! turns further pushes into no-ops; the producer has to notice
//! [`Pusher::is_cancelled`] to exit.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use tokio::sync::{Notify, Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionHandle, Outcome};
use crate::error::{Error, Result};

struct Slot<T> {
    permits: Semaphore,
    value: Mutex<Option<T>>,
    delivered: Notify,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
            value: Mutex::new(None),
            delivered: Notify::new(),
        }
    }

    fn put(&self, value: T) {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none(), "slot written while full");
        *slot = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Producer side of a [`Feedback`] channel.
pub struct Pusher<T> {
    slot: Arc<Slot<T>>,
    cancel: CancellationToken,
}

impl<T> Pusher<T> {
    /// Hand `value` to the consumer, waiting while the previous value is unread.
    ///
    /// Returns `false` without delivering if the channel was aborted or
    /// dropped. Never fails into the producer.
    pub async fn push(&self, value: T) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            permit = self.slot.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        if self.cancel.is_cancelled() {
            return false;
        }

        // Released by the consumer once it has read the value.
        permit.forget();
        self.slot.put(value);
        self.slot.delivered.notify_one();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Consumer side of a single-slot channel fed by an async producer.
pub struct Feedback<T> {
    slot: Arc<Slot<T>>,
    producer: CompletionHandle,
    finished: watch::Receiver<Option<Outcome>>,
    failure_reported: bool,
}

impl<T> Feedback<T>
where
    T: Send + 'static,
{
    /// Start `supply` on the runtime and return the consuming end.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new<F, Fut, E>(supply: F) -> Self
    where
        F: FnOnce(Pusher<T>) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let slot = Arc::new(Slot::new());
        let producer_slot = Arc::clone(&slot);
        let producer = CompletionHandle::spawn(move |cancel| {
            supply(Pusher {
                slot: producer_slot,
                cancel,
            })
        });
        let finished = producer.subscribe();

        tracing::trace!(producer = %producer.id(), "Feedback channel created");

        Self {
            slot,
            producer,
            finished,
            failure_reported: false,
        }
    }

    /// Next value in push order.
    ///
    /// `Ok(None)` means the producer has finished and the slot is empty. A
    /// value pushed right before the producer finished is still delivered
    /// first. A producer failure is reported once as [`Error::Producer`].
    pub async fn next(&mut self) -> Result<Option<T>> {
        let slot = Arc::clone(&self.slot);
        loop {
            let delivered = slot.delivered.notified();

            // Read the outcome before the slot: a finished producer has
            // already stored its last value.
            let outcome = self.producer.outcome();

            if let Some(value) = slot.take() {
                slot.permits.add_permits(1);
                return Ok(Some(value));
            }

            if let Some(outcome) = outcome {
                return self.end_of_stream(outcome);
            }

            tokio::select! {
                _ = delivered => {}
                _ = self.finished.changed() => {}
            }
        }
    }

    fn end_of_stream(&mut self, outcome: Outcome) -> Result<Option<T>> {
        match outcome {
            Outcome::Failed(message) if !self.failure_reported => {
                self.failure_reported = true;
                tracing::debug!(producer = %self.producer.id(), error = %message, "Producer failed");
                Err(Error::Producer(message))
            }
            _ => Ok(None),
        }
    }

    /// Make further pushes no-ops. Does not stop the producer by itself.
    pub fn abort(&self) {
        self.producer.stop();
    }

    pub fn is_aborted(&self) -> bool {
        self.producer.is_cancelled()
    }

    /// True once the producer's future has completed.
    pub fn is_finished(&self) -> bool {
        self.producer.is_finished()
    }

    /// Wait for the producer's future to complete.
    pub async fn completion(&self) -> Outcome {
        self.producer.wait().await
    }

    /// Adapt into a [`Stream`] that ends after the producer finishes.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures::stream::unfold(self, |mut feedback| async move {
            match feedback.next().await {
                Ok(Some(value)) => Some((Ok(value), feedback)),
                Ok(None) => None,
                Err(e) => Some((Err(e), feedback)),
            }
        })
    }
}

impl<T> Drop for Feedback<T> {
    fn drop(&mut self) {
        self.producer.stop();
        self.slot.permits.close();
    }
}
