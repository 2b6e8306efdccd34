//! Error types for the Kestrel runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur during runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A handle did not resolve to a live object
    #[error("Invalid handle: {handle:#x}")]
    InvalidHandle {
        /// Raw handle value that failed to resolve
        handle: u64,
    },

    /// Operation is illegal in the current command/stream/event state
    #[error("Illegal state: {reason}")]
    StateError {
        /// What was attempted and why it is illegal
        reason: String,
    },

    /// No hardware slot (or other finite resource) was available
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// Resource that ran out
        resource: String,
    },

    /// Illegal resource lifecycle operation
    #[error("Resource error: {reason}")]
    ResourceError {
        /// Reason for refusal
        reason: String,
    },

    /// The hardware context entered an unusable state
    #[error("Hardware context {context} is in a fatal state")]
    DeviceFatal {
        /// Context id of the dead context
        context: u32,
    },

    /// I/O error talking to the device file
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// No command queue backend could be opened for the target
    #[error("No command queue available for {target}")]
    QueueUnavailable {
        /// Device target that was probed
        target: String,
    },
}

impl RuntimeError {
    /// Create an invalid handle error
    pub fn invalid_handle(handle: u64) -> Self {
        Self::InvalidHandle { handle }
    }

    /// Create a state error
    pub fn state(reason: impl Into<String>) -> Self {
        Self::StateError {
            reason: reason.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a resource lifecycle error
    pub fn resource(reason: impl Into<String>) -> Self {
        Self::ResourceError {
            reason: reason.into(),
        }
    }

    /// Create a fatal context error
    pub fn fatal(context: u32) -> Self {
        Self::DeviceFatal { context }
    }

    /// Whether this error is the asynchronous fatal-context kind
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFatal { .. })
    }
}
