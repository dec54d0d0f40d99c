use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::handler::{FaultSink, HandlerFault};

/// Environment override for the default worker count.
pub const PARALLELISM_ENV: &str = "RELAYKIT_PARALLELISM";

#[derive(Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub parallelism: usize,
    pub fault_sink: Option<FaultSink>,
    /// Cancelling this token completes the pool.
    pub parent: Option<CancellationToken>,
}

impl ListenerConfig {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_fault_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(HandlerFault) + Send + Sync + 'static,
    {
        self.fault_sink = Some(Arc::new(sink));
        self
    }

    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        let parallelism = parse_parallelism(std::env::var(PARALLELISM_ENV).ok().as_deref())
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1);

        Self {
            name: "listener".to_string(),
            parallelism,
            fault_sink: None,
            parent: None,
        }
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("name", &self.name)
            .field("parallelism", &self.parallelism)
            .field("fault_sink", &self.fault_sink.is_some())
            .field("parent", &self.parent.is_some())
            .finish()
    }
}

fn parse_parallelism(raw: Option<&str>) -> Option<usize> {
    raw?.trim().parse::<usize>().ok().filter(|n| *n > 0)
}
