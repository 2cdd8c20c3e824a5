//! Pass scheduler
//!
//! A [`Runner`] overlaps up to K passes over one graph. Each pass occupies a
//! slot (a forward [`Instance`] and, when training, a backward one) for its
//! whole lifetime. Readiness is tracked per instance with open/closed/finished
//! sets, and a single tokio task serializes all bookkeeping, so completions
//! arriving out of order from the accelerator never race each other.

// Module declarations
pub mod config;
pub mod instance;
pub mod parameters;
pub mod program;
pub mod runner;
pub mod snapshot;
pub mod stats;
mod task;
pub mod types;

pub use config::RunnerConfig;
pub use instance::{Direction, Instance};
pub use runner::Runner;
pub use snapshot::Snapshot;
pub use stats::PassStats;
pub use types::{PassCompletion, PassError, PassId, PassKind, SchedulerError, SchedulerResult};
