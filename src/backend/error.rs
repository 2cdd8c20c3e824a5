//! Accelerator error types

use thiserror::Error;

/// Accelerator error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Buffer allocation failed for '{label}' ({len} elements): {reason}")]
    AllocationFailed {
        label: String,
        len: usize,
        reason: String,
    },
    #[error("Invalid accelerator configuration: {0}")]
    InvalidConfig(String),
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),
    #[error("Unknown device buffer: {0}")]
    UnknownBuffer(u64),
    #[error("Access out of bounds on buffer {buffer}: offset {offset} + len {len} > capacity {capacity}")]
    OutOfBounds {
        buffer: u64,
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("Work submission failed: {0}")]
    SubmissionFailed(String),
    #[error("Kernel '{kernel}' failed: {reason}")]
    KernelFailed { kernel: String, reason: String },
    #[error("Command stream could not be started: {0}")]
    StreamStartFailed(String),
    #[error("Command stream closed")]
    StreamClosed,
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for BackendError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BackendError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Accelerator result type
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Errors that only affect the work unit that raised them.
    ///
    /// A missing kernel or a broken stream will fail every later pass too.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::AllocationFailed { .. }
                | BackendError::SubmissionFailed(_)
                | BackendError::KernelFailed { .. }
                | BackendError::OutOfBounds { .. }
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(BackendError::SubmissionFailed("busy".into()).is_recoverable());
        assert!(BackendError::KernelFailed {
            kernel: "relu_forward".into(),
            reason: "bad length".into()
        }
        .is_recoverable());
        assert!(BackendError::KernelNotFound("fft".into()).is_permanent());
        assert!(BackendError::StreamClosed.is_permanent());
    }

    #[test]
    fn test_out_of_bounds_display() {
        let err = BackendError::OutOfBounds {
            buffer: 7,
            offset: 4,
            len: 8,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "Access out of bounds on buffer 7: offset 4 + len 8 > capacity 10"
        );
    }
}
