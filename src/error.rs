use thiserror::Error;

/// Failure to acquire the interpreter runtime
///
/// Cloneable because one in-flight load is shared by every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error(
        "Runtime loader failed to load from {location}: {reason}. Set LESSON_RUNTIME_BASE if hosting locally."
    )]
    LoaderUnavailable { location: String, reason: String },
    #[error("Failed to load runtime (loader entry missing)")]
    EntryMissing,
    #[error("Runtime failed to start: {0}")]
    Startup(String),
}

/// Failure of a single request inside a loaded runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The code raised inside the runtime; carries the formatted trace
    #[error("{0}")]
    Raised(String),
    #[error("Runtime is no longer running")]
    Closed,
    #[error("Runtime protocol error: {0}")]
    Protocol(String),
}
