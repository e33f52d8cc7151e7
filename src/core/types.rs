use serde::{Deserialize, Serialize};

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Missing collaborators (registry, dispatcher, runner, store).
    ConfigurationError,
    /// Unknown targets, empty inventories, bad guard syntax.
    ResolutionError,
    ValidationError,
    /// Module failures, non-2xx agent replies, transport failures.
    ExecutionError,
    TimeoutError,
    CanceledError,
    /// Invalid transitions, duplicate or missing run ids.
    StateError,
    NotificationError,
    NetworkError,
    SerializationError,
    IoError,
    InternalError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error severity enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Error,
    Warning,
    Info,
    Debug,
}
