//! Unified error handling for graphforge
//!
//! Every module defines its own `thiserror` enum; this module folds them into
//! [`ForgeError`] and classifies them for handling decisions:
//! - User errors (graph construction, configuration)
//! - Recoverable errors (a single pass failed, runner shutting down)
//! - Backend errors (accelerator failures)
//! - Internal errors (scheduler invariant violations, i.e. bugs)

use std::fmt;

use crate::backend::BackendError;
use crate::graph::GraphError;
use crate::layers::LayerError;
use crate::logging::LoggingError;
use crate::scheduler::{PassError, SchedulerError};
use crate::solver::SolverError;

/// Unified error type for graphforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Construction Errors ==========
    /// Graph topology or capability error
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Layer definition error
    #[error(transparent)]
    Layer(#[from] LayerError),

    // ========== Backend Errors ==========
    /// Accelerator failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    // ========== Scheduler Errors ==========
    /// Runner configuration or lifecycle error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A single pass failed; reported through its completion
    #[error("pass failed: {0}")]
    Pass(#[from] PassError),

    // ========== Solver Errors ==========
    #[error(transparent)]
    Solver(#[from] SolverError),

    // ========== Logging Errors ==========
    #[error(transparent)]
    Logging(#[from] LoggingError),

    // ========== Internal Errors ==========
    /// Lock poisoned (indicates a bug or a panic while holding a lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::Graph(_) | ForgeError::Layer(_) | ForgeError::Logging(_) => {
                ErrorCategory::User
            }

            ForgeError::Backend(err) => match err {
                BackendError::KernelNotFound(_) | BackendError::InvalidConfig(_) => ErrorCategory::User,
                _ => ErrorCategory::Backend,
            },

            ForgeError::Scheduler(err) => match err {
                SchedulerError::InvalidConfig(_)
                | SchedulerError::TrainingDisabled
                | SchedulerError::SourceBatchMismatch { .. }
                | SchedulerError::UnknownKey(_) => ErrorCategory::User,
                SchedulerError::ShutDown | SchedulerError::CompletionDropped => {
                    ErrorCategory::Recoverable
                }
                SchedulerError::InvariantViolation(_) => ErrorCategory::Internal,
            },

            ForgeError::Pass(err) => match err {
                PassError::InvariantViolation(_) => ErrorCategory::Internal,
                _ => ErrorCategory::Recoverable,
            },

            ForgeError::Solver(err) => match err {
                SolverError::StepFailed { source, .. } => source.category(),
                _ => ErrorCategory::User,
            },

            ForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (retrying the pass may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this is a user-facing error (fix the graph or config)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: fix the graph, layer or configuration and rebuild
/// - Recoverable: the pass failed, the runner is still usable
/// - Internal: log and report as bug
/// - Backend: accelerator problem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid graph or configuration
    User,
    /// Recoverable error - a pass failed or the runner is stopping
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Backend error - accelerator failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using ForgeError
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BufferId;

    #[test]
    fn test_error_categories() {
        let err: ForgeError = GraphError::UnknownBuffer(BufferId::from_index(3)).into();
        assert_eq!(err.category(), ErrorCategory::User);

        let err: ForgeError = BackendError::KernelNotFound("relu_forward".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::User);

        let err: ForgeError = BackendError::SubmissionFailed("queue full".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Backend);

        let err: ForgeError = SchedulerError::ShutDown.into();
        assert_eq!(err.category(), ErrorCategory::Recoverable);

        let err: ForgeError = PassError::InvariantViolation("double finish".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_pass_failures_are_recoverable() {
        let err: ForgeError = PassError::SubmissionFailed {
            node: "ip".to_string(),
            reason: "out of memory".to_string(),
        }
        .into();
        assert!(err.is_recoverable());
        assert!(!err.is_user_error());
        assert!(!err.is_internal_error());
    }

    #[test]
    fn test_solver_step_failure_inherits_category() {
        let inner: ForgeError = PassError::KernelFailed {
            node: "loss".to_string(),
            reason: "nan".to_string(),
        }
        .into();
        let err: ForgeError = SolverError::StepFailed {
            step: 4,
            source: Box::new(inner),
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Recoverable);
        assert!(err.to_string().contains("step 4"));
    }

    #[test]
    fn test_poison_error_from_impl_exists() {
        use std::sync::PoisonError;

        fn convert_poison<T>(err: PoisonError<T>) -> ForgeError {
            ForgeError::from(err)
        }

        let _ = convert_poison::<i32> as fn(PoisonError<i32>) -> ForgeError;
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::User.to_string(), "User");
        assert_eq!(ErrorCategory::Recoverable.to_string(), "Recoverable");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
        assert_eq!(ErrorCategory::Backend.to_string(), "Backend");
    }
}
