//! The scheduling task
//!
//! One tokio task owns every instance and processes [`SchedulerEvent`]s one at
//! a time, so all open/closed/finished bookkeeping and every completion
//! callback run strictly serialized. Accelerator completion signals only post
//! events back onto the queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::{debug, error, trace, warn};

use crate::backend::{Accelerator, BackendResult, CompletionSignal, WorkPhase, WorkTag, WorkUnit};
use crate::graph::{Graph, NodeId};
use crate::layout;
use crate::solver::SgdParameters;

use super::instance::{Direction, Instance};
use super::parameters::ParameterStore;
use super::program::{Program, Storage};
use super::snapshot::Snapshot;
use super::stats::PassStats;
use super::types::{PassCompletion, PassError, PassId, PassKind};

/// Messages processed by the scheduling task
pub(crate) enum SchedulerEvent {
    Start(PassRequest),
    NodeFinished {
        slot: usize,
        pass: PassId,
        node: NodeId,
        direction: Direction,
        result: BackendResult<()>,
    },
    UpdateFinished {
        slot: usize,
        pass: PassId,
        result: BackendResult<()>,
    },
    Stats(oneshot::Sender<PassStats>),
    /// Stop accepting passes, wait for in-flight ones, free everything
    Shutdown(Option<oneshot::Sender<()>>),
}

/// A pass admitted by the runner: it already holds a permit and its source data
pub(crate) struct PassRequest {
    pub id: PassId,
    pub kind: PassKind,
    pub batches: Vec<(NodeId, Vec<f32>)>,
    pub completion: PassCompletion,
    pub permit: OwnedSemaphorePermit,
}

struct ActivePass {
    id: PassId,
    kind: PassKind,
    completion: Option<PassCompletion>,
    _permit: OwnedSemaphorePermit,
    failure: Option<PassError>,
    /// Submitted work units whose completion has not arrived
    pending: usize,
    updating: bool,
    started: Instant,
}

/// A forward instance and, when training, its paired backward instance
pub(crate) struct Slot {
    pub forward: Instance,
    pub backward: Option<Instance>,
    active: Option<ActivePass>,
}

impl Slot {
    pub fn new(forward: Instance, backward: Option<Instance>) -> Self {
        Slot {
            forward,
            backward,
            active: None,
        }
    }

    fn instance_mut(&mut self, direction: Direction) -> Option<&mut Instance> {
        match direction {
            Direction::Forward => Some(&mut self.forward),
            Direction::Backward => self.backward.as_mut(),
        }
    }
}

pub(crate) struct SchedulerCore {
    graph: Arc<Graph>,
    accelerator: Arc<dyn Accelerator>,
    program: Program,
    parameters: ParameterStore,
    slots: Vec<Slot>,
    cursor: usize,
    batch_size: usize,
    label: String,
    stats: PassStats,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    stopping: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl SchedulerCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<Graph>,
        accelerator: Arc<dyn Accelerator>,
        program: Program,
        parameters: ParameterStore,
        slots: Vec<Slot>,
        batch_size: usize,
        label: String,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        SchedulerCore {
            graph,
            accelerator,
            program,
            parameters,
            slots,
            cursor: 0,
            batch_size,
            label,
            stats: PassStats::default(),
            events,
            stopping: false,
            shutdown_waiters: Vec::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerEvent>) {
        debug!(runner = %self.label, slots = self.slots.len(), "scheduler task started");
        while let Some(event) = rx.recv().await {
            self.handle(event);
            if self.stopping && self.stats.in_flight == 0 {
                break;
            }
        }

        // passes queued behind the shutdown still get their completion
        rx.close();
        while let Ok(event) = rx.try_recv() {
            match event {
                SchedulerEvent::Start(request) => reject(request.completion, PassError::ShutDown),
                SchedulerEvent::Shutdown(Some(reply)) => self.shutdown_waiters.push(reply),
                _ => {}
            }
        }
        self.release();
    }

    fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Start(request) => self.start(request),
            SchedulerEvent::NodeFinished {
                slot,
                pass,
                node,
                direction,
                result,
            } => self.node_finished(slot, pass, node, direction, result),
            SchedulerEvent::UpdateFinished { slot, pass, result } => {
                self.update_finished(slot, pass, result)
            }
            SchedulerEvent::Stats(reply) => {
                let _ = reply.send(self.stats.clone());
            }
            SchedulerEvent::Shutdown(reply) => {
                debug!(runner = %self.label, in_flight = self.stats.in_flight, "shutdown requested");
                self.stopping = true;
                self.shutdown_waiters.extend(reply);
            }
        }
    }

    /// First idle slot at or after the cursor
    fn pick_slot(&mut self) -> Option<usize> {
        let count = self.slots.len();
        let slot = (0..count)
            .map(|i| (self.cursor + i) % count)
            .find(|i| self.slots[*i].active.is_none())?;
        self.cursor = (slot + 1) % count;
        Some(slot)
    }

    fn start(&mut self, request: PassRequest) {
        let PassRequest {
            id,
            kind,
            batches,
            completion,
            permit,
        } = request;

        if self.stopping {
            reject(completion, PassError::ShutDown);
            return;
        }
        let Some(slot) = self.pick_slot() else {
            self.stats.invariant_violations += 1;
            error!(pass = %id, "no idle slot for an admitted pass");
            reject(
                completion,
                PassError::InvariantViolation("no idle slot for an admitted pass".to_string()),
            );
            return;
        };

        self.stats.record_start();
        debug!(pass = %id, slot, kind = kind.label(), in_flight = self.stats.in_flight, "pass started");

        let failure = self.prepare(slot, kind, &batches).err();
        self.slots[slot].active = Some(ActivePass {
            id,
            kind,
            completion: Some(completion),
            _permit: permit,
            failure,
            pending: 0,
            updating: false,
            started: Instant::now(),
        });

        if let Err(e) = self.seed(slot, kind) {
            self.fail(slot, e);
        }
        self.drain(slot);
        self.try_complete(slot);
    }

    /// Reset the slot, zero backward storage and upload source data.
    fn prepare(&mut self, slot: usize, kind: PassKind, batches: &[(NodeId, Vec<f32>)]) -> Result<(), PassError> {
        let accelerator = self.accelerator.as_ref();
        let s = &mut self.slots[slot];
        s.forward.reset();
        if let Some(backward) = s.backward.as_mut() {
            backward.reset();
        }

        if kind.is_training() {
            let backward = s.backward.as_ref().ok_or_else(|| {
                PassError::InvariantViolation("training pass on a slot without backward instance".to_string())
            })?;
            backward
                .clear(accelerator)
                .map_err(|e| PassError::TransferFailed(e.to_string()))?;
        }

        for (node, data) in batches {
            let n = self
                .graph
                .node(*node)
                .ok_or_else(|| PassError::InvariantViolation(format!("unknown source {}", node)))?;
            let device = n
                .output()
                .and_then(|b| s.forward.buffer(b))
                .ok_or_else(|| PassError::InvariantViolation(format!("source '{}' has no output", n.name())))?;
            accelerator
                .upload(device, n.output_offset() * self.batch_size, data)
                .map_err(|e| PassError::TransferFailed(format!("source '{}': {}", n.name(), e)))?;
        }
        Ok(())
    }

    /// Settle sources (and, for training, sinks and inert nodes in the
    /// backward instance) and open whatever they make ready.
    fn seed(&mut self, slot: usize, kind: PassKind) -> Result<(), PassError> {
        let graph = Arc::clone(&self.graph);
        let s = &mut self.slots[slot];

        for source in graph.source_nodes() {
            s.forward.settle(*source).map_err(invariant)?;
        }
        for source in graph.source_nodes() {
            for next in s.forward.ready_successors(&graph, *source) {
                s.forward.open(next);
            }
        }

        if kind.is_training() {
            if let Some(backward) = s.backward.as_mut() {
                for node in graph.sink_nodes().iter().chain(self.program.backward_inert()) {
                    backward.settle(*node).map_err(invariant)?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch open nodes until both stacks are empty or the pass failed.
    fn drain(&mut self, slot: usize) {
        loop {
            let Some(active) = self.slots[slot].active.as_ref() else {
                return;
            };
            if active.failure.is_some() {
                return;
            }

            let s = &mut self.slots[slot];
            if let Some(node) = s.forward.pop_open() {
                self.dispatch(slot, node, Direction::Forward);
            } else if let Some(node) = s.backward.as_mut().and_then(|b| b.pop_open()) {
                self.dispatch(slot, node, Direction::Backward);
            } else {
                return;
            }
        }
    }

    fn dispatch(&mut self, slot: usize, node: NodeId, direction: Direction) {
        let graph = Arc::clone(&self.graph);
        let Some(n) = graph.node(node) else {
            self.fail(slot, PassError::InvariantViolation(format!("unknown {}", node)));
            return;
        };

        // sources and sinks hold no work
        if !n.kind().is_transform() {
            return;
        }

        let invocations = self.program.invocations(node, direction);
        if invocations.is_empty() {
            let settled = match self.slots[slot].instance_mut(direction) {
                Some(instance) => instance.settle(node).map_err(invariant),
                None => Err(PassError::InvariantViolation(format!(
                    "{:?} instance missing for '{}'",
                    direction,
                    n.name()
                ))),
            };
            match settled {
                Ok(()) => self.after_close(slot, node, direction),
                Err(e) => self.fail(slot, e),
            }
            return;
        }

        let (pass, commands) = {
            let s = &self.slots[slot];
            let Some(active) = s.active.as_ref() else {
                return;
            };
            let storage = Storage {
                forward: &s.forward,
                backward: s.backward.as_ref(),
                parameters: &self.parameters,
            };
            let commands: Result<Vec<_>, String> =
                invocations.iter().map(|inv| storage.resolve(inv)).collect();
            (active.id, commands)
        };
        let commands = match commands {
            Ok(commands) => commands,
            Err(reason) => {
                self.fail(
                    slot,
                    PassError::InvariantViolation(format!("node '{}': {}", n.name(), reason)),
                );
                return;
            }
        };

        let work = WorkUnit {
            tag: WorkTag {
                pass: pass.raw(),
                slot,
                node: Some(node.index()),
                phase: match direction {
                    Direction::Forward => WorkPhase::Forward,
                    Direction::Backward => WorkPhase::Backward,
                },
            },
            commands,
        };
        let events = self.events.clone();
        let signal = CompletionSignal::new(move |result| {
            let _ = events.send(SchedulerEvent::NodeFinished {
                slot,
                pass,
                node,
                direction,
                result,
            });
        });

        trace!(pass = %pass, slot, node = node.index(), layer = n.name(), ?direction, "dispatch");
        if let Err(e) = self.accelerator.submit(work, signal) {
            warn!(pass = %pass, slot, layer = n.name(), error = %e, "submission failed");
            self.fail(
                slot,
                PassError::SubmissionFailed {
                    node: n.name().to_string(),
                    reason: e.to_string(),
                },
            );
            return;
        }

        let s = &mut self.slots[slot];
        if let Some(active) = s.active.as_mut() {
            active.pending += 1;
        }
        if let Some(instance) = s.instance_mut(direction) {
            instance.close(node);
        }
        self.after_close(slot, node, direction);
    }

    /// Open the nodes a freshly closed node made ready. A loss node closing
    /// in the forward instance seeds the backward traversal.
    fn after_close(&mut self, slot: usize, node: NodeId, direction: Direction) {
        let graph = Arc::clone(&self.graph);
        let s = &mut self.slots[slot];
        let training = s.active.as_ref().map_or(false, |a| a.kind.is_training());

        if let Some(instance) = s.instance_mut(direction) {
            for next in instance.ready_successors(&graph, node) {
                instance.open(next);
            }
        }

        let is_loss = graph.node(node).map_or(false, |n| n.kind().is_loss());
        if direction == Direction::Forward && training && is_loss {
            if let Some(backward) = s.backward.as_mut() {
                if backward.is_ready(&graph, node) {
                    backward.open(node);
                }
            }
        }
    }

    fn node_finished(
        &mut self,
        slot: usize,
        pass: PassId,
        node: NodeId,
        direction: Direction,
        result: BackendResult<()>,
    ) {
        let name = self
            .graph
            .node(node)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| node.to_string());
        let Some(s) = self.slots.get_mut(slot) else {
            self.stats.invariant_violations += 1;
            error!(slot, "completion for unknown slot");
            return;
        };
        let Some(active) = s.active.as_mut().filter(|a| a.id == pass) else {
            self.stats.invariant_violations += 1;
            error!(pass = %pass, slot, node = node.index(), "completion for a pass that is not running");
            return;
        };

        active.pending = active.pending.saturating_sub(1);
        if let Err(e) = result {
            warn!(pass = %pass, slot, layer = %name, error = %e, "work failed");
            active.failure.get_or_insert(PassError::KernelFailed {
                node: name.clone(),
                reason: e.to_string(),
            });
        }

        let finished = match direction {
            Direction::Forward => Some(&mut s.forward),
            Direction::Backward => s.backward.as_mut(),
        }
        .map(|instance| instance.finish(node));
        match finished {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.stats.invariant_violations += 1;
                error!(pass = %pass, slot, layer = %name, error = %e, "completion out of order");
                active.failure.get_or_insert(invariant(e));
            }
            None => {
                self.stats.invariant_violations += 1;
                active.failure.get_or_insert(PassError::InvariantViolation(format!(
                    "{:?} completion for '{}' on a slot without that instance",
                    direction, name
                )));
            }
        }

        trace!(pass = %pass, slot, node = node.index(), ?direction, "node finished");
        self.try_complete(slot);
    }

    fn try_complete(&mut self, slot: usize) {
        let s = &self.slots[slot];
        let Some(active) = s.active.as_ref() else {
            return;
        };

        if active.failure.is_some() {
            if active.pending == 0 {
                self.finish_pass(slot);
            }
            return;
        }
        if active.updating {
            return;
        }

        let forward_done = s.forward.is_finished();
        let backward_done =
            !active.kind.is_training() || s.backward.as_ref().map_or(false, |b| b.is_finished());
        if !(forward_done && backward_done) {
            return;
        }

        match active.kind.update() {
            Some(params) if !self.parameters.is_empty() => self.submit_update(slot, params),
            _ => self.finish_pass(slot),
        }
    }

    fn submit_update(&mut self, slot: usize, params: SgdParameters) {
        let s = &self.slots[slot];
        let Some(pass) = s.active.as_ref().map(|a| a.id) else {
            return;
        };
        let commands = s
            .backward
            .as_ref()
            .and_then(|backward| self.parameters.update_commands(backward, params));
        let Some(commands) = commands else {
            self.fail(
                slot,
                PassError::InvariantViolation("gradient or velocity storage missing".to_string()),
            );
            self.finish_pass(slot);
            return;
        };

        let work = WorkUnit {
            tag: WorkTag {
                pass: pass.raw(),
                slot,
                node: None,
                phase: WorkPhase::Update,
            },
            commands,
        };
        let events = self.events.clone();
        let signal = CompletionSignal::new(move |result| {
            let _ = events.send(SchedulerEvent::UpdateFinished { slot, pass, result });
        });

        trace!(
            pass = %pass,
            slot,
            learning_rate = params.learning_rate,
            momentum = params.momentum,
            "submitting parameter update"
        );
        match self.accelerator.submit(work, signal) {
            Ok(()) => {
                if let Some(active) = self.slots[slot].active.as_mut() {
                    active.updating = true;
                    active.pending += 1;
                }
            }
            Err(e) => {
                self.fail(slot, PassError::UpdateFailed(e.to_string()));
                self.finish_pass(slot);
            }
        }
    }

    fn update_finished(&mut self, slot: usize, pass: PassId, result: BackendResult<()>) {
        let Some(active) = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.active.as_mut())
            .filter(|a| a.id == pass && a.updating)
        else {
            self.stats.invariant_violations += 1;
            error!(pass = %pass, slot, "update completion for a pass that is not updating");
            return;
        };

        active.pending = active.pending.saturating_sub(1);
        active.updating = false;
        if let Err(e) = result {
            active
                .failure
                .get_or_insert(PassError::UpdateFailed(e.to_string()));
        }
        self.finish_pass(slot);
    }

    /// Record the first failure of a pass; dispatch stops at the next check.
    fn fail(&mut self, slot: usize, error: PassError) {
        if let Some(active) = self.slots[slot].active.as_mut() {
            active.failure.get_or_insert(error);
        }
    }

    /// Feed sinks, run the completion callback and release the slot and permit.
    fn finish_pass(&mut self, slot: usize) {
        let Some(mut active) = self.slots[slot].active.take() else {
            return;
        };

        let mut outcome = match active.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if outcome.is_ok() {
            if let Err(e) = self.feed_sinks(slot) {
                outcome = Err(e);
            }
        }

        self.stats.record_finish(outcome.is_ok());
        let elapsed_us = active.started.elapsed().as_micros() as u64;
        match &outcome {
            Ok(()) => debug!(pass = %active.id, slot, elapsed_us, "pass completed"),
            Err(e) => warn!(pass = %active.id, slot, elapsed_us, error = %e, "pass failed"),
        }

        if let Some(completion) = active.completion.take() {
            let s = &self.slots[slot];
            let snapshot = Snapshot {
                graph: &self.graph,
                accelerator: self.accelerator.as_ref(),
                forward: &s.forward,
                backward: if active.kind.is_training() {
                    s.backward.as_ref()
                } else {
                    None
                },
                parameters: &self.parameters,
                pass: active.id,
                kind: active.kind,
                batch_size: self.batch_size,
            };
            let result = outcome.as_ref().map(|_| &snapshot).map_err(Clone::clone);
            if panic::catch_unwind(AssertUnwindSafe(move || completion(result))).is_err() {
                error!(pass = %active.id, slot, "completion callback panicked");
            }
        }
        // dropping the pass releases its permit
        drop(active);
    }

    /// Hand each sink its input region, rearranged to sample-major order.
    fn feed_sinks(&self, slot: usize) -> Result<(), PassError> {
        let forward = &self.slots[slot].forward;
        for sink in self.graph.sink_nodes() {
            let Some(node) = self.graph.node(*sink) else {
                continue;
            };
            let Some(device) = node.input().and_then(|b| forward.buffer(b)) else {
                continue;
            };
            let size = node.layer().input_size();
            let data = self
                .accelerator
                .download(device, node.input_offset() * self.batch_size, size * self.batch_size)
                .map_err(|e| PassError::TransferFailed(format!("sink '{}': {}", node.name(), e)))?;
            let samples = layout::to_sample_major(&data, size, self.batch_size);
            node.layer().consume(&samples, self.batch_size);
        }
        Ok(())
    }

    /// Free every device buffer and wake shutdown waiters.
    fn release(&mut self) {
        let accelerator = Arc::clone(&self.accelerator);
        for slot in &mut self.slots {
            slot.forward.free(accelerator.as_ref());
            if let Some(backward) = slot.backward.as_mut() {
                backward.free(accelerator.as_ref());
            }
        }
        self.parameters.free(accelerator.as_ref());
        debug!(runner = %self.label, stats = ?self.stats, "scheduler task stopped");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn invariant(error: super::types::SchedulerError) -> PassError {
    PassError::InvariantViolation(error.to_string())
}

fn reject(completion: PassCompletion, error: PassError) {
    if panic::catch_unwind(AssertUnwindSafe(move || completion(Err(error)))).is_err() {
        error!("completion callback panicked");
    }
}
