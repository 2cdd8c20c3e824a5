//! graphforge - dependency-tracking scheduler for compute graphs
//!
//! Build a [`Graph`] of layers connected through buffers, hand it to a
//! [`Runner`] together with an [`Accelerator`], and request forward or
//! training passes. Up to K passes overlap, each in its own execution
//! instance; completions from the accelerator may arrive in any order.
//! [`SgdSolver`] drives repeated training steps with a learning-rate schedule.

#![allow(clippy::too_many_arguments)] // Kernel argument lists and core constructors
#![allow(clippy::type_complexity)] // Boxed completion callbacks

pub mod backend;
pub mod error;
pub mod graph;
pub mod layers;
pub mod layout;
pub mod logging;
pub mod scheduler;
pub mod solver;

pub use backend::{Accelerator, CpuAccelerator, CpuConfig};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use graph::{Graph, GraphBuilder, GraphError};
pub use layers::{Capabilities, Layer, LayerRef};
pub use scheduler::{PassError, PassId, PassKind, PassStats, Runner, RunnerConfig, Snapshot};
pub use solver::{LearningRateSchedule, SgdParameters, SgdSolver, SolverConfig, SolverReport};
