//! Listener pool: fixed-size fan-out workers over a take-from-any queue set.
//!
//! - `post`/`try_post` enqueue items; no ordering across workers
//! - handler faults are captured per item and sent to an optional sink
//! - `when_free` reports an empty backlog, `when_idle` also waits for handlers

mod config;
mod handler;
mod pool;
mod queues;

pub use config::{ListenerConfig, PARALLELISM_ENV};
pub use handler::{AsyncFnHandler, FaultSink, HandlerFault, ItemHandler, SyncFnHandler};
pub use pool::{ListenerPool, PoolLoad};
