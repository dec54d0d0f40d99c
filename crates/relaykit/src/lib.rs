//! relaykit: cooperative cancellation, completion handles and in-process
//! work distribution on top of tokio.

mod completion;
mod error;
mod feedback;
mod pipeline;
mod state;
mod version;

pub mod listener;

pub use completion::{CompletionHandle, Outcome};
pub use error::{Error, Result};
pub use feedback::{Feedback, Pusher};
pub use listener::{
    AsyncFnHandler, FaultSink, HandlerFault, ItemHandler, ListenerConfig, ListenerPool, PoolLoad,
    SyncFnHandler,
};
pub use pipeline::{Pipeline, PipelineBuilder, StageKind};
pub use state::{CancellationToken, ProcessPhase, ProcessState, ProcessStateToken};
pub use version::{RELAYKIT_VERSION, version_line};
