//! Item handlers for the listener pool.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::state::ProcessStateToken;

/// Per-item work run by a pool worker.
///
/// Errors and panics are captured per item and never stop the worker.
/// Long-running handlers should call [`ProcessStateToken::checkpoint`]
/// so pause and cancel requests take effect.
#[async_trait]
pub trait ItemHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T, state: ProcessStateToken) -> anyhow::Result<()>;
}

/// A handler failure captured by the pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler fault on worker {worker}: {message}")]
pub struct HandlerFault {
    pub worker: usize,
    pub message: String,
    pub panicked: bool,
}

impl HandlerFault {
    pub(crate) fn error(worker: usize, message: String) -> Self {
        Self {
            worker,
            message,
            panicked: false,
        }
    }

    pub(crate) fn panic(worker: usize, message: String) -> Self {
        Self {
            worker,
            message,
            panicked: true,
        }
    }
}

/// Observer for handler faults.
pub type FaultSink = Arc<dyn Fn(HandlerFault) + Send + Sync>;

/// Synchronous closure handler. Runs on the blocking thread pool.
pub struct SyncFnHandler<F, T> {
    f: Arc<F>,
    _item: PhantomData<fn(T)>,
}

impl<F, T> SyncFnHandler<F, T> {
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> ItemHandler<T> for SyncFnHandler<F, T>
where
    F: Fn(T, &ProcessStateToken) -> anyhow::Result<()> + Send + Sync + 'static,
    T: Send + 'static,
{
    async fn handle(&self, item: T, state: ProcessStateToken) -> anyhow::Result<()> {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(item, &state)).await {
            Ok(result) => result,
            // Re-raise so the worker records it as a panic, not an error.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking handler aborted: {e}")),
        }
    }
}

/// Asynchronous closure handler.
pub struct AsyncFnHandler<F, T> {
    f: F,
    _item: PhantomData<fn(T)>,
}

impl<F, T> AsyncFnHandler<F, T> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> ItemHandler<T> for AsyncFnHandler<F, T>
where
    F: Fn(T, ProcessStateToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: Send + 'static,
{
    async fn handle(&self, item: T, state: ProcessStateToken) -> anyhow::Result<()> {
        (self.f)(item, state).await
    }
}
