//! Fixed-size pool of workers draining a shared multi-queue.
//!
//! Workers are spawned once at construction and run until the pool is
//! completed. Each worker checkpoints between items, so the pool can be
//! paused and resumed through its [`ProcessState`].

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::ListenerConfig;
use super::handler::{AsyncFnHandler, FaultSink, HandlerFault, ItemHandler, SyncFnHandler};
use super::queues::MultiQueue;
use crate::error::{Error, Result, panic_message};
use crate::state::{ProcessPhase, ProcessState, ProcessStateToken};

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolLoad {
    /// Posted, not yet taken by a worker.
    pub queued: usize,
    /// Taken, handler still running.
    pub in_flight: usize,
    /// Handler returned (successfully or not).
    pub processed: usize,
    /// Subset of `processed` that faulted.
    pub faulted: usize,
}

impl PoolLoad {
    pub fn is_drained(&self) -> bool {
        self.queued == 0
    }

    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

struct PoolShared<T> {
    name: String,
    queues: MultiQueue<T>,
    state: ProcessState,
    load: watch::Sender<PoolLoad>,
    fault_sink: Option<FaultSink>,
}

impl<T> PoolShared<T> {
    fn report(&self, fault: HandlerFault) {
        tracing::warn!(
            pool = %self.name,
            worker = fault.worker,
            panicked = fault.panicked,
            error = %fault.message,
            "Handler fault - item dropped"
        );
        if let Some(sink) = &self.fault_sink {
            sink(fault);
        }
    }

    /// Resolves `true` once `done` holds, `false` if `token` or the pool is
    /// cancelled first.
    async fn wait_load(&self, token: &CancellationToken, done: fn(&PoolLoad) -> bool) -> bool {
        let mut load = self.load.subscribe();
        let pool_cancel = self.state.cancellation_token();
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = pool_cancel.cancelled() => false,
            reached = async { load.wait_for(done).await.is_ok() } => reached,
        }
    }
}

/// Fan-out pool applying a handler to every posted item.
pub struct ListenerPool<T> {
    shared: Arc<PoolShared<T>>,
    parallelism: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ListenerPool<T>
where
    T: Send + 'static,
{
    pub fn new<H>(parallelism: usize, handler: H) -> Result<Self>
    where
        H: ItemHandler<T>,
    {
        Self::with_config(ListenerConfig::new(parallelism), handler)
    }

    /// Pool with a synchronous handler, run on the blocking thread pool.
    pub fn from_fn<F>(parallelism: usize, f: F) -> Result<Self>
    where
        F: Fn(T, &ProcessStateToken) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(parallelism, SyncFnHandler::new(f))
    }

    /// Pool with an asynchronous handler.
    pub fn from_async_fn<F, Fut>(parallelism: usize, f: F) -> Result<Self>
    where
        F: Fn(T, ProcessStateToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(parallelism, AsyncFnHandler::new(f))
    }

    /// Spawn `config.parallelism` workers on the current tokio runtime.
    pub fn with_config<H>(config: ListenerConfig, handler: H) -> Result<Self>
    where
        H: ItemHandler<T>,
    {
        if config.parallelism == 0 {
            return Err(Error::invalid_argument("parallelism must be at least 1"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::misuse("listener pool must be created inside a tokio runtime"))?;

        let state = match &config.parent {
            Some(parent) => ProcessState::with_cancellation(parent.child_token()),
            None => ProcessState::new(),
        };

        let shared = Arc::new(PoolShared {
            name: config.name,
            queues: MultiQueue::new(config.parallelism),
            state,
            load: watch::channel(PoolLoad::default()).0,
            fault_sink: config.fault_sink,
        });

        // Wake workers parked on the queues when cancelled from outside.
        {
            let shared = Arc::clone(&shared);
            runtime.spawn(async move {
                shared.state.token().cancelled().await;
                shared.queues.close();
            });
        }

        let handler = Arc::new(handler);
        let workers = (0..config.parallelism)
            .map(|worker| {
                runtime.spawn(run_worker(
                    worker,
                    Arc::clone(&shared),
                    Arc::clone(&handler),
                ))
            })
            .collect();

        tracing::debug!(pool = %shared.name, parallelism = config.parallelism, "Listener pool started");

        Ok(Self {
            shared,
            parallelism: config.parallelism,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue an item for the next free worker.
    ///
    /// Fails with [`Error::Cancelled`] once the pool has been completed.
    pub fn post(&self, item: T) -> Result<()> {
        if self.shared.state.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        // Count before enqueueing so a worker never takes an uncounted item.
        self.shared.load.send_modify(|l| l.queued += 1);
        let queue = self.shared.queues.add(item);
        tracing::trace!(pool = %self.shared.name, queue, "Item posted");
        Ok(())
    }

    /// Like [`post`](Self::post) but reports a stopped pool as `false`.
    pub fn try_post(&self, item: T) -> bool {
        self.post(item).is_ok()
    }
}

impl<T> ListenerPool<T> {
    /// Resolves `true` once no posted item is waiting in a queue.
    ///
    /// Items already taken are not counted: a handler may still be running
    /// when this resolves. Use [`when_idle`](Self::when_idle) to also wait
    /// for in-flight handlers. Resolves `false` if `token` or the pool is
    /// cancelled first.
    pub async fn when_free(&self, token: &CancellationToken) -> bool {
        self.shared.wait_load(token, PoolLoad::is_drained).await
    }

    /// Resolves `true` once nothing is queued and no handler is running.
    pub async fn when_idle(&self, token: &CancellationToken) -> bool {
        self.shared.wait_load(token, PoolLoad::is_idle).await
    }

    /// Stop taking new items. Idempotent; running handlers are not aborted.
    pub fn complete(&self) {
        if !self.shared.state.is_cancel_requested() {
            tracing::debug!(pool = %self.shared.name, "Listener pool completing");
        }
        self.shared.state.request_cancel();
        self.shared.queues.close();
    }

    /// Complete the pool and wait for every worker loop to exit.
    pub async fn shutdown(&self) {
        self.complete();
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(pool = %self.shared.name, error = %e, "Worker task failed");
            }
        }
    }

    /// Ask workers to park at their next checkpoint.
    ///
    /// Returns `false` (and leaves the pool running) if no worker parked
    /// within `timeout`.
    pub async fn pause(&self, timeout: Duration) -> bool {
        self.shared.state.request_pause(timeout).await
    }

    pub fn resume(&self) {
        self.shared.state.resume();
    }

    pub fn phase(&self) -> ProcessPhase {
        self.shared.state.phase()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.is_cancel_requested()
    }

    pub fn load(&self) -> PoolLoad {
        *self.shared.load.borrow()
    }

    /// Items waiting in the queues right now.
    pub fn queued(&self) -> usize {
        self.shared.queues.len()
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> Drop for ListenerPool<T> {
    fn drop(&mut self) {
        self.complete();
    }
}

async fn run_worker<T, H>(worker: usize, shared: Arc<PoolShared<T>>, handler: Arc<H>)
where
    T: Send + 'static,
    H: ItemHandler<T>,
{
    let token = shared.state.token();
    tracing::trace!(pool = %shared.name, worker, "Worker started");

    loop {
        if token.is_pause_requested() {
            tracing::trace!(pool = %shared.name, worker, "Worker parked");
            token.acknowledge_pause_and_wait().await;
        }
        if token.is_cancellation_requested() {
            break;
        }

        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = token.pause_requested() => continue,
            item = shared.queues.take_any(worker) => match item {
                Some(item) => item,
                None => break,
            },
        };

        shared.load.send_modify(|l| {
            l.queued -= 1;
            l.in_flight += 1;
        });

        let result = AssertUnwindSafe(handler.handle(item, token.clone()))
            .catch_unwind()
            .await;

        let fault = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(HandlerFault::error(worker, format!("{e:#}"))),
            Err(payload) => Some(HandlerFault::panic(worker, panic_message(payload.as_ref()))),
        };
        let faulted = fault.is_some();
        if let Some(fault) = fault {
            shared.report(fault);
        }

        shared.load.send_modify(|l| {
            l.in_flight -= 1;
            l.processed += 1;
            if faulted {
                l.faulted += 1;
            }
        });
    }

    tracing::trace!(pool = %shared.name, worker, "Worker stopped");
}
