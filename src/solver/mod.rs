//! SGD training loop
//!
//! [`SgdSolver`] drives a training [`Runner`] for a fixed number of steps.
//! Every step is one `train_step` pass: forward, backward, then the momentum
//! update `v = m * v + lr * g; p -= v` submitted by the scheduler before the
//! pass completes. The solver awaits each step before requesting the next, so
//! updates never overlap a pass that reads the same parameters.

pub mod schedule;

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::scheduler::{Runner, SchedulerError, Snapshot};

pub use schedule::{LearningRateSchedule, SgdParameters};

/// Solver error types
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Invalid solver state transition from {from}")]
    InvalidStateTransition { from: SolverState },
    #[error("Invalid solver configuration: {0}")]
    InvalidConfig(String),
    #[error("Graph has no trainable nodes")]
    NoTrainableNodes,
    #[error("Training step {step} failed: {source}")]
    StepFailed {
        step: usize,
        #[source]
        source: Box<ForgeError>,
    },
}

/// Lifecycle of a solver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Idle,
    Running { step: usize },
    Done,
    Failed { step: usize },
}

impl fmt::Display for SolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverState::Idle => write!(f, "idle"),
            SolverState::Running { step } => write!(f, "running (step {})", step),
            SolverState::Done => write!(f, "done"),
            SolverState::Failed { step } => write!(f, "failed (step {})", step),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub step_count: usize,
    pub schedule: LearningRateSchedule,
}

impl SolverConfig {
    pub fn new(step_count: usize) -> Self {
        SolverConfig {
            step_count,
            schedule: LearningRateSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: LearningRateSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn validate(&self) -> Result<(), SolverError> {
        if self.step_count == 0 {
            return Err(SolverError::InvalidConfig(
                "step_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a completed training run
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReport {
    pub steps: usize,
    /// Loss reported by each step, in order
    pub losses: Vec<f32>,
}

impl SolverReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

type StepObserver = Arc<dyn Fn(usize, &Snapshot<'_>) + Send + Sync>;

pub struct SgdSolver {
    runner: Arc<Runner>,
    config: SolverConfig,
    observer: Option<StepObserver>,
    state: Mutex<SolverState>,
}

impl SgdSolver {
    pub fn new(runner: Arc<Runner>, config: SolverConfig) -> ForgeResult<Self> {
        config.validate()?;
        if !runner.is_training() {
            return Err(SchedulerError::TrainingDisabled.into());
        }
        if runner.graph().trainable_nodes().is_empty() {
            return Err(SolverError::NoTrainableNodes.into());
        }
        Ok(SgdSolver {
            runner,
            config,
            observer: None,
            state: Mutex::new(SolverState::Idle),
        })
    }

    /// Called after every step with that step's snapshot, before the next
    /// step starts. Runs on the scheduling task, so keep it short.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize, &Snapshot<'_>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn state(&self) -> ForgeResult<SolverState> {
        Ok(*self.state.lock()?)
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Return a finished or failed solver to `Idle`.
    pub fn reset(&self) -> ForgeResult<()> {
        let mut state = self.state.lock()?;
        match *state {
            SolverState::Done | SolverState::Failed { .. } | SolverState::Idle => {
                *state = SolverState::Idle;
                Ok(())
            }
            from @ SolverState::Running { .. } => {
                Err(SolverError::InvalidStateTransition { from }.into())
            }
        }
    }

    /// Run every configured step.
    pub async fn train(&self) -> ForgeResult<SolverReport> {
        self.set_running(0, true)?;
        info!(steps = self.config.step_count, "solver started");

        let mut losses = Vec::with_capacity(self.config.step_count);
        for step in 1..=self.config.step_count {
            self.set_running(step, false)?;
            let params = self.config.schedule.parameters_at(step);
            let observer = self.observer.clone();

            let outcome = self
                .runner
                .train_step_with(params, move |snapshot| {
                    if let Some(observer) = observer {
                        observer(step, snapshot);
                    }
                    snapshot.loss()
                })
                .await;

            let loss = match outcome.and_then(|loss| loss) {
                Ok(loss) => loss,
                Err(e) => {
                    warn!(step, error = %e, "solver step failed");
                    *self.state.lock()? = SolverState::Failed { step };
                    return Err(SolverError::StepFailed {
                        step,
                        source: Box::new(e),
                    }
                    .into());
                }
            };

            debug!(
                step,
                loss,
                learning_rate = params.learning_rate,
                momentum = params.momentum,
                "solver step finished"
            );
            losses.push(loss);
        }

        *self.state.lock()? = SolverState::Done;
        info!(
            steps = self.config.step_count,
            final_loss = losses.last().copied().unwrap_or_default(),
            "solver finished"
        );
        Ok(SolverReport {
            steps: self.config.step_count,
            losses,
        })
    }

    /// `starting` moves Idle to Running; otherwise the step index advances.
    fn set_running(&self, step: usize, starting: bool) -> ForgeResult<()> {
        let mut state = self.state.lock()?;
        match (*state, starting) {
            (SolverState::Idle, true) | (SolverState::Running { .. }, false) => {
                *state = SolverState::Running { step };
                Ok(())
            }
            (from, _) => Err(SolverError::InvalidStateTransition { from }.into()),
        }
    }
}

impl fmt::Debug for SgdSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SgdSolver")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
