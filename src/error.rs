//! Error types and handling for rs2-flow
//!
//! Every stream in this crate carries `StreamResult<T>` items. An `Err` item is
//! terminal: the stream that yields it ends immediately afterwards.

use std::fmt::Display;

use tokio::task::JoinError;

/// Main error type for rs2-flow operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The underlying pull sequence failed while producing a value
    #[error("source error: {0}")]
    Source(String),
    /// A user supplied map/filter/flat-map or parallel transform failed
    #[error("transform error: {0}")]
    Transform(String),
    /// An event or pool producer failed before it finished
    #[error("producer error: {0}")]
    Producer(String),
    /// A signal was abandoned before it fired, or the consumer went away
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn source(err: impl Display) -> Self {
        StreamError::Source(err.to_string())
    }

    pub fn transform(err: impl Display) -> Self {
        StreamError::Transform(err.to_string())
    }

    pub fn producer(err: impl Display) -> Self {
        StreamError::Producer(err.to_string())
    }

    /// Map a failed transform task into a [`StreamError::Transform`].
    pub(crate) fn from_transform_join(err: JoinError) -> Self {
        StreamError::Transform(join_error_message(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Source(err.to_string())
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

/// Result type for rs2-flow operations
pub type StreamResult<T> = Result<T, StreamError>;
