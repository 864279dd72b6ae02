//! Error types for the on-target test rig

use thiserror::Error;

/// Main error type for the test rig
#[derive(Error, Debug)]
pub enum RigError {
    /// Bad magic or short read on an intercept channel. Fatal for that channel.
    #[error("Frame protocol error: {0}")]
    Framing(String),

    /// Command issued while the MI context is held by another actor.
    #[error("Context violation: {0}")]
    ContextViolation(String),

    /// The debugger reported a command failure.
    #[error("Debugger command error: {0}")]
    Command(String),

    /// No response or no run-state change within the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Breakpoint creation did not yield the expected confirmation.
    #[error("Breakpoint registration failed: {0}")]
    Registration(String),

    /// Cleanup failure. Teardown paths log these instead of returning them.
    #[error("Teardown failed: {0}")]
    Teardown(String),

    /// I/O failure on the MI transport. Fatal to the whole session.
    #[error("Transport fault: {0}")]
    Transport(String),

    /// Target could not be brought into the requested run state.
    #[error("Target state error: {0}")]
    TargetState(String),

    /// Operation not supported by this breakpoint variant.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RigError {
    fn from(error: anyhow::Error) -> Self {
        RigError::Internal(error.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RigError>;
