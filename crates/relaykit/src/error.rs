use thiserror::Error;

/// Errors surfaced by relaykit primitives.
///
/// Cancellation is an expected control-flow signal, not a crash: callers
/// match on [`Error::Cancelled`] and unwind their own work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("stage {index} expected a value of type {expected}")]
    StageType { index: usize, expected: &'static str },

    #[error("stage {index} failed: {message}")]
    Stage { index: usize, message: String },

    #[error("producer failed: {0}")]
    Producer(String),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
