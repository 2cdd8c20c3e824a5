//! Public handle to a running scheduler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::Accelerator;
use crate::error::ForgeResult;
use crate::graph::{Graph, NodeId};
use crate::solver::SgdParameters;

use super::config::RunnerConfig;
use super::task::{PassRequest, SchedulerCore, SchedulerEvent, Slot};
use super::instance::{Direction, Instance};
use super::parameters::ParameterStore;
use super::program::Program;
use super::snapshot::Snapshot;
use super::stats::PassStats;
use super::types::{PassCompletion, PassError, PassId, PassKind, SchedulerError};

/// Runs passes over one sealed graph with up to `instance_count` of them in
/// flight.
///
/// Requesting a pass waits for a free instance (a semaphore permit), pulls
/// one batch from every source and hands the pass to the scheduling task.
/// The returned future resolves once the pass is queued; its outcome arrives
/// through the completion callback, which always runs exactly once on the
/// scheduling task.
///
/// Construct inside a tokio runtime.
pub struct Runner {
    graph: Arc<Graph>,
    config: RunnerConfig,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    next_pass: AtomicU64,
    core: Mutex<Option<JoinHandle<()>>>,
    parameter_count: usize,
}

impl Runner {
    /// Seal `graph`, compile every layer and allocate the instance pool.
    ///
    /// With a batch size above one, a transpose node is inserted behind every
    /// source first, so `graph` must not be sealed yet in that case.
    pub fn new(
        mut graph: Graph,
        accelerator: Arc<dyn Accelerator>,
        config: RunnerConfig,
    ) -> ForgeResult<Self> {
        config.validate()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            SchedulerError::InvalidConfig("a runner must be created inside a tokio runtime".to_string())
        })?;

        if config.batch_size > 1 {
            let inserted = graph.insert_transpose_nodes()?;
            debug!(count = inserted.len(), "inserted transpose nodes");
        }
        graph.seal()?;

        if config.training && graph.loss_nodes().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "training requires at least one loss node".to_string(),
            )
            .into());
        }

        let mut program = Program::compile(
            &graph,
            accelerator.as_ref(),
            config.batch_size,
            config.training,
        )?;
        let mut parameters = ParameterStore::allocate(
            accelerator.as_ref(),
            program.take_parameters(),
            &config.label,
            config.training,
        )?;

        let slots = match allocate_slots(&graph, accelerator.as_ref(), &config, &parameters) {
            Ok(slots) => slots,
            Err(e) => {
                parameters.free(accelerator.as_ref());
                return Err(e);
            }
        };

        let parameter_count = parameters.len();
        let graph = Arc::new(graph);
        let (events, rx) = mpsc::unbounded_channel();
        let core = SchedulerCore::new(
            Arc::clone(&graph),
            Arc::clone(&accelerator),
            program,
            parameters,
            slots,
            config.batch_size,
            config.label.clone(),
            events.clone(),
        );
        let task = handle.spawn(core.run(rx));

        info!(
            runner = %config.label,
            accelerator = accelerator.name(),
            nodes = graph.node_count(),
            buffers = graph.buffer_count(),
            parameters = parameter_count,
            instances = config.instance_count,
            batch_size = config.batch_size,
            training = config.training,
            "runner started"
        );

        Ok(Runner {
            graph,
            permits: Arc::new(Semaphore::new(config.instance_count)),
            config,
            events,
            next_pass: AtomicU64::new(0),
            core: Mutex::new(Some(task)),
            parameter_count,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn instance_count(&self) -> usize {
        self.config.instance_count
    }

    pub fn is_training(&self) -> bool {
        self.config.training
    }

    /// Number of trainable parameter tensors across all layers
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Permits not held by any pass
    pub fn available_instances(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue a forward-only pass.
    pub async fn forward<F>(&self, completion: F) -> ForgeResult<PassId>
    where
        F: FnOnce(Result<&Snapshot<'_>, PassError>) + Send + 'static,
    {
        self.request(PassKind::Forward, Box::new(completion)).await
    }

    /// Queue a forward and backward pass. Gradients are visible in the
    /// snapshot; parameters are left untouched.
    pub async fn train<F>(&self, completion: F) -> ForgeResult<PassId>
    where
        F: FnOnce(Result<&Snapshot<'_>, PassError>) + Send + 'static,
    {
        self.request(PassKind::Train, Box::new(completion)).await
    }

    /// Queue a training pass followed by an SGD update of every parameter.
    /// The completion sees the updated parameters.
    pub async fn train_step<F>(&self, params: SgdParameters, completion: F) -> ForgeResult<PassId>
    where
        F: FnOnce(Result<&Snapshot<'_>, PassError>) + Send + 'static,
    {
        self.request(PassKind::TrainStep(params), Box::new(completion)).await
    }

    /// Run a forward pass and return what `extract` reads from its snapshot.
    pub async fn forward_with<T, F>(&self, extract: F) -> ForgeResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.request_with(PassKind::Forward, extract).await
    }

    pub async fn train_with<T, F>(&self, extract: F) -> ForgeResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.request_with(PassKind::Train, extract).await
    }

    pub async fn train_step_with<T, F>(&self, params: SgdParameters, extract: F) -> ForgeResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.request_with(PassKind::TrainStep(params), extract).await
    }

    async fn request_with<T, F>(&self, kind: PassKind, extract: F) -> ForgeResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.request(
            kind,
            Box::new(move |result: Result<&Snapshot<'_>, PassError>| {
                let _ = tx.send(result.map(extract));
            }),
        )
        .await?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SchedulerError::CompletionDropped.into()),
        }
    }

    async fn request(&self, kind: PassKind, completion: PassCompletion) -> ForgeResult<PassId> {
        if kind.is_training() && !self.config.training {
            return Err(SchedulerError::TrainingDisabled.into());
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::ShutDown)?;
        let batches = self.collect_batches()?;

        let id = PassId(self.next_pass.fetch_add(1, Ordering::SeqCst));
        self.events
            .send(SchedulerEvent::Start(PassRequest {
                id,
                kind,
                batches,
                completion,
                permit,
            }))
            .map_err(|_| SchedulerError::ShutDown)?;

        debug!(pass = %id, kind = kind.label(), "pass queued");
        Ok(id)
    }

    /// One batch from every source, checked against its output size.
    fn collect_batches(&self) -> ForgeResult<Vec<(NodeId, Vec<f32>)>> {
        let batch_size = self.config.batch_size;
        let mut batches = Vec::with_capacity(self.graph.source_nodes().len());
        for id in self.graph.source_nodes() {
            let Some(node) = self.graph.node(*id) else {
                continue;
            };
            let data = node.layer().next_batch(batch_size)?;
            let expected = node.layer().output_size() * batch_size;
            if data.len() != expected {
                return Err(SchedulerError::SourceBatchMismatch {
                    source_name: node.name().to_string(),
                    expected,
                    actual: data.len(),
                }
                .into());
            }
            batches.push((*id, data));
        }
        Ok(batches)
    }

    /// Counters kept by the scheduling task
    pub async fn stats(&self) -> ForgeResult<PassStats> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SchedulerEvent::Stats(tx))
            .map_err(|_| SchedulerError::ShutDown)?;
        Ok(rx.await.map_err(|_| SchedulerError::ShutDown)?)
    }

    /// Stop accepting passes, wait for in-flight ones to complete and free
    /// every device buffer.
    pub async fn shutdown(&self) -> ForgeResult<()> {
        info!(runner = %self.config.label, "shutting down runner");
        self.permits.close();

        let (tx, rx) = oneshot::channel();
        if self.events.send(SchedulerEvent::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }

        let task = self.core.lock()?.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(runner = %self.config.label, error = %e, "scheduling task failed");
            }
        }
        Ok(())
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.permits.close();
        let _ = self.events.send(SchedulerEvent::Shutdown(None));
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("nodes", &self.graph.node_count())
            .field("available_instances", &self.permits.available_permits())
            .finish()
    }
}

fn allocate_slots(
    graph: &Graph,
    accelerator: &dyn Accelerator,
    config: &RunnerConfig,
    parameters: &ParameterStore,
) -> ForgeResult<Vec<Slot>> {
    let mut slots: Vec<Slot> = Vec::with_capacity(config.instance_count);
    let result = (0..config.instance_count).try_for_each(|i| -> ForgeResult<()> {
        let label = format!("{}.{}", config.label, i);
        let forward = Instance::allocate(
            graph,
            accelerator,
            Direction::Forward,
            config.batch_size,
            &label,
            &[],
        )?;
        let backward = if config.training {
            match Instance::allocate(
                graph,
                accelerator,
                Direction::Backward,
                config.batch_size,
                &label,
                parameters.specs(),
            ) {
                Ok(backward) => Some(backward),
                Err(e) => {
                    let mut forward = forward;
                    forward.free(accelerator);
                    return Err(e);
                }
            }
        } else {
            None
        };
        slots.push(Slot::new(forward, backward));
        Ok(())
    });

    if let Err(e) = result {
        for slot in &mut slots {
            slot.forward.free(accelerator);
            if let Some(backward) = slot.backward.as_mut() {
                backward.free(accelerator);
            }
        }
        return Err(e);
    }
    Ok(slots)
}
