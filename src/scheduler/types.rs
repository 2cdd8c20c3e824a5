//! Core types for the pass scheduler

use std::fmt;

use thiserror::Error;

use super::snapshot::Snapshot;
use crate::solver::SgdParameters;

/// Errors raised by the runner itself, outside any single pass
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Invalid runner configuration: {0}")]
    InvalidConfig(String),
    #[error("Runner was built without training support")]
    TrainingDisabled,
    #[error("Runner is shut down")]
    ShutDown,
    #[error("Source '{source_name}' produced {actual} elements, expected {expected}")]
    SourceBatchMismatch {
        source_name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Unknown buffer, node or parameter: {0}")]
    UnknownKey(String),
    #[error("Scheduler invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Pass completion was dropped before it fired")]
    CompletionDropped,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a single pass failed. Delivered through its completion callback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    #[error("submitting work for node '{node}' failed: {reason}")]
    SubmissionFailed { node: String, reason: String },
    #[error("work for node '{node}' failed: {reason}")]
    KernelFailed { node: String, reason: String },
    #[error("parameter update failed: {0}")]
    UpdateFailed(String),
    #[error("host transfer failed: {0}")]
    TransferFailed(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("runner shut down before the pass started")]
    ShutDown,
}

/// Identity of one requested pass, unique per runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) u64);

impl PassId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass#{}", self.0)
    }
}

/// What a pass does
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassKind {
    /// Forward traversal only
    Forward,
    /// Forward then backward; gradients are left in the backward instance
    Train,
    /// Forward, backward, then a parameter update with these settings
    TrainStep(SgdParameters),
}

impl PassKind {
    pub fn is_training(&self) -> bool {
        !matches!(self, PassKind::Forward)
    }

    pub fn update(&self) -> Option<SgdParameters> {
        match self {
            PassKind::TrainStep(params) => Some(*params),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PassKind::Forward => "forward",
            PassKind::Train => "train",
            PassKind::TrainStep(_) => "train_step",
        }
    }
}

/// Callback invoked exactly once per pass, on the scheduler task.
///
/// The snapshot is only valid for the duration of the call: the instance it
/// reads from is recycled by the next pass assigned to the same slot.
pub type PassCompletion = Box<dyn FnOnce(Result<&Snapshot<'_>, PassError>) + Send + 'static>;
