//! SGD solver runs on the CPU accelerator

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use graphforge::backend::{CpuAccelerator, CpuConfig};
use graphforge::graph::GraphBuilder;
use graphforge::layers::{kernels, CollectSink, DataSource, L2LossLayer};
use graphforge::scheduler::{RunnerConfig, SchedulerError};
use graphforge::solver::{
    LearningRateSchedule, SgdParameters, SgdSolver, SolverConfig, SolverError, SolverState,
};
use graphforge::{ErrorCategory, ForgeError};

/// Full-batch plain gradient descent on the regression fixture
fn regression_solver(steps: usize, schedule: LearningRateSchedule) -> SgdSolver {
    let config = RunnerConfig::default()
        .with_training(true)
        .with_batch_size(4)
        .with_instance_count(1);
    let runner = Arc::new(runner(linear_regression(), cpu(), config));
    SgdSolver::new(runner, SolverConfig::new(steps).with_schedule(schedule)).expect("solver")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loss_decreases_on_linear_regression() -> anyhow::Result<()> {
    let schedule = LearningRateSchedule::Constant(SgdParameters::new(0.2, 0.0));
    let solver = regression_solver(150, schedule);

    let report = solver.train().await?;
    assert_eq!(report.steps, 150);
    assert_eq!(report.losses.len(), 150);

    // zero-initialized weights: the first loss is 0.5 * mean(y^2)
    assert!((report.losses[0] - 1.59375).abs() < 1e-4);
    assert!((report.losses[1] - 1.001484).abs() < 1e-3);
    for pair in report.losses.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6, "loss went up: {:?}", pair);
    }
    assert!(report.final_loss().unwrap() < 1e-3);
    assert_eq!(solver.state()?, SolverState::Done);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_learning_rate_keeps_loss_flat() -> anyhow::Result<()> {
    let schedule = LearningRateSchedule::custom(|_| SgdParameters::new(0.0, 0.9));
    let report = regression_solver(5, schedule).train().await?;
    assert!(report.losses.iter().all(|l| (l - 1.59375).abs() < 1e-5));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observer_sees_every_step() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let steps = Arc::new(Mutex::new(Vec::new()));
    let (c, s) = (Arc::clone(&calls), Arc::clone(&steps));

    let schedule = LearningRateSchedule::StepDecay {
        base: SgdParameters::new(0.2, 0.0),
        gamma: 0.5,
        step_size: 2,
    };
    let solver = regression_solver(4, schedule).with_observer(move |step, snapshot| {
        c.fetch_add(1, Ordering::SeqCst);
        s.lock().unwrap().push((step, snapshot.pass_id()));
    });

    solver.train().await?;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let seen = steps.lock().unwrap().clone();
    let indices: Vec<usize> = seen.iter().map(|(step, _)| *step).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    // one pass per step, issued in order
    for pair in seen.windows(2) {
        assert_eq!(pair[0].1.raw() + 1, pair[1].1.raw());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_solver_state_transitions() -> anyhow::Result<()> {
    let solver = regression_solver(2, LearningRateSchedule::default());
    assert_eq!(solver.state()?, SolverState::Idle);

    solver.train().await?;
    assert_eq!(solver.state()?, SolverState::Done);

    // a finished solver must be reset before it runs again
    let err = solver.train().await.unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Solver(SolverError::InvalidStateTransition {
            from: SolverState::Done
        })
    ));

    solver.reset()?;
    assert_eq!(solver.state()?, SolverState::Idle);
    assert_eq!(solver.train().await?.steps, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_update_stops_the_run() -> anyhow::Result<()> {
    let accelerator = Arc::new(CpuAccelerator::new(
        CpuConfig::default().with_failing_kernel(kernels::SGD_UPDATE),
    )?);
    let runner = Arc::new(runner(
        linear_regression(),
        accelerator,
        RunnerConfig::default().with_training(true),
    ));
    let solver = SgdSolver::new(runner, SolverConfig::new(3))?;

    let err = solver.train().await.unwrap_err();
    match &err {
        ForgeError::Solver(SolverError::StepFailed { step, .. }) => assert_eq!(*step, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.category(), ErrorCategory::Recoverable);
    assert_eq!(solver.state()?, SolverState::Failed { step: 1 });

    solver.reset()?;
    assert_eq!(solver.state()?, SolverState::Idle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_solver_construction_errors() {
    // forward-only runner
    let runner_plain = Arc::new(runner(linear_regression(), cpu(), RunnerConfig::default()));
    let err = SgdSolver::new(Arc::clone(&runner_plain), SolverConfig::new(1)).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Scheduler(SchedulerError::TrainingDisabled)
    ));

    // zero steps
    let err = SgdSolver::new(runner_plain, SolverConfig::new(0)).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Solver(SolverError::InvalidConfig(_))
    ));
    assert!(err.is_user_error());

    // a loss with nothing to train
    let x = Arc::new(DataSource::new("x", 1, vec![1.0]));
    let y = Arc::new(DataSource::new("y", 1, vec![0.0]));
    let loss = Arc::new(L2LossLayer::new("loss", 1));
    let sink = Arc::new(CollectSink::new("out", 1));
    let mut builder = GraphBuilder::new();
    let x_id = builder.add(&x).unwrap();
    let y_id = builder.add(&y).unwrap();
    let loss_id = builder.add(&loss).unwrap();
    let sink_id = builder.add(&sink).unwrap();
    builder.join(&[x_id, y_id], loss_id).unwrap();
    builder.link(loss_id, sink_id).unwrap();

    let trainless = Arc::new(runner(
        builder.finish(),
        cpu(),
        RunnerConfig::default().with_training(true),
    ));
    let err = SgdSolver::new(trainless, SolverConfig::new(1)).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Solver(SolverError::NoTrainableNodes)
    ));
}
