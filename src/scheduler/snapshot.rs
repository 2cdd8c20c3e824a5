//! Read-only view of a finished pass

use crate::backend::{Accelerator, DeviceBuffer};
use crate::error::ForgeResult;
use crate::graph::{BufferId, BufferSide, Graph, NodeId};

use super::instance::Instance;
use super::parameters::ParameterStore;
use super::types::{PassId, PassKind, SchedulerError};

/// Borrowed view of one slot's buffers, handed to a pass's completion.
///
/// Buffer contents come back in the physical, feature-major layout: element
/// `i` of batch item `b` is at `i * batch_size + b` (see [`crate::layout`]).
/// With a batch size of one this is simply the logical order.
pub struct Snapshot<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) accelerator: &'a dyn Accelerator,
    pub(crate) forward: &'a Instance,
    pub(crate) backward: Option<&'a Instance>,
    pub(crate) parameters: &'a ParameterStore,
    pub(crate) pass: PassId,
    pub(crate) kind: PassKind,
    pub(crate) batch_size: usize,
}

impl<'a> Snapshot<'a> {
    pub fn pass_id(&self) -> PassId {
        self.pass
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Whole forward buffer
    pub fn forward_contents(&self, buffer: BufferId) -> ForgeResult<Vec<f32>> {
        self.whole(self.forward, buffer)
    }

    pub fn forward_contents_named(&self, name: &str) -> ForgeResult<Vec<f32>> {
        self.forward_contents(self.named(name)?)
    }

    /// Whole backward (delta) buffer; training passes only
    pub fn backward_contents(&self, buffer: BufferId) -> ForgeResult<Vec<f32>> {
        self.whole(self.backward()?, buffer)
    }

    pub fn backward_contents_named(&self, name: &str) -> ForgeResult<Vec<f32>> {
        self.backward_contents(self.named(name)?)
    }

    /// The region `node` wrote
    pub fn output_of(&self, node: NodeId) -> ForgeResult<Vec<f32>> {
        self.region(self.forward, node, BufferSide::Output)
    }

    /// The region `node` read
    pub fn input_of(&self, node: NodeId) -> ForgeResult<Vec<f32>> {
        self.region(self.forward, node, BufferSide::Input)
    }

    /// Deltas accumulated for `node`'s input region
    pub fn input_deltas_of(&self, node: NodeId) -> ForgeResult<Vec<f32>> {
        self.region(self.backward()?, node, BufferSide::Input)
    }

    /// Deltas that arrived at `node`'s output region
    pub fn output_deltas_of(&self, node: NodeId) -> ForgeResult<Vec<f32>> {
        self.region(self.backward()?, node, BufferSide::Output)
    }

    /// Current value of a parameter. After a `train_step` this is the
    /// updated value.
    pub fn parameter(&self, node: NodeId, name: &str) -> ForgeResult<Vec<f32>> {
        let id = self.parameter_id(node, name)?;
        let buffer = self
            .parameters
            .value(id)
            .ok_or_else(|| unknown(format!("{} parameter '{}'", node, name)))?;
        self.download(buffer)
    }

    /// Gradient of a parameter computed by this pass
    pub fn gradient(&self, node: NodeId, name: &str) -> ForgeResult<Vec<f32>> {
        let id = self.parameter_id(node, name)?;
        let buffer = self
            .backward()?
            .gradient(id)
            .ok_or_else(|| unknown(format!("{} gradient '{}'", node, name)))?;
        self.download(buffer)
    }

    /// Sum of every loss node's output over the batch
    pub fn loss(&self) -> ForgeResult<f32> {
        let mut total = 0.0;
        for node in self.graph.loss_nodes() {
            total += self.output_of(*node)?.iter().sum::<f32>();
        }
        Ok(total)
    }

    fn backward(&self) -> ForgeResult<&'a Instance> {
        self.backward
            .ok_or_else(|| SchedulerError::TrainingDisabled.into())
    }

    fn named(&self, name: &str) -> ForgeResult<BufferId> {
        self.graph
            .buffer_named(name)
            .ok_or_else(|| unknown(format!("buffer '{}'", name)))
    }

    fn parameter_id(&self, node: NodeId, name: &str) -> ForgeResult<crate::layers::ParameterId> {
        self.parameters
            .find(node, name)
            .ok_or_else(|| unknown(format!("{} parameter '{}'", node, name)))
    }

    fn whole(&self, instance: &Instance, buffer: BufferId) -> ForgeResult<Vec<f32>> {
        let device = instance
            .buffer(buffer)
            .ok_or_else(|| unknown(buffer.to_string()))?;
        self.download(device)
    }

    fn region(&self, instance: &Instance, node: NodeId, side: BufferSide) -> ForgeResult<Vec<f32>> {
        let n = self
            .graph
            .node(node)
            .ok_or_else(|| unknown(node.to_string()))?;
        let (buffer, offset, size) = match side {
            BufferSide::Input => (n.input(), n.input_offset(), n.layer().input_size()),
            BufferSide::Output => (n.output(), n.output_offset(), n.layer().output_size()),
        };
        let buffer = buffer.ok_or_else(|| unknown(format!("{} {} buffer", n.name(), side)))?;
        let device = instance
            .buffer(buffer)
            .ok_or_else(|| unknown(buffer.to_string()))?;
        Ok(self.accelerator.download(
            device,
            offset * self.batch_size,
            size * self.batch_size,
        )?)
    }

    fn download(&self, buffer: &DeviceBuffer) -> ForgeResult<Vec<f32>> {
        Ok(self.accelerator.download(buffer, 0, buffer.len())?)
    }
}

fn unknown(key: String) -> crate::error::ForgeError {
    SchedulerError::UnknownKey(key).into()
}
