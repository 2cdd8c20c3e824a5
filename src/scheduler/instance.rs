//! Execution instances: physical buffers plus per-pass progress sets
//!
//! A node moves unopened -> open -> closed -> finished within one instance.
//! `open` is a LIFO stack of dispatchable nodes, `closed` holds nodes whose
//! work was submitted and `finished` those whose completion arrived.

use std::collections::HashSet;

use crate::backend::{Accelerator, DeviceBuffer};
use crate::error::ForgeResult;
use crate::graph::{BufferId, Graph, NodeId};
use crate::layers::{ParameterId, ParameterSpec};

use super::types::SchedulerError;

/// Traversal direction an instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inputs to outputs; buffers hold activations
    Forward,
    /// Outputs to inputs; buffers hold deltas
    Backward,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Direction::Forward => "fwd",
            Direction::Backward => "bwd",
        }
    }
}

/// One physically backed copy of the graph's buffers
#[derive(Debug)]
pub struct Instance {
    direction: Direction,
    buffers: Vec<DeviceBuffer>,
    gradients: Vec<DeviceBuffer>,
    open: Vec<NodeId>,
    closed: HashSet<NodeId>,
    finished: HashSet<NodeId>,
}

impl Instance {
    /// Allocate `size * batch_size` elements per graph buffer. Backward
    /// instances also get one gradient buffer per parameter.
    pub fn allocate(
        graph: &Graph,
        accelerator: &dyn Accelerator,
        direction: Direction,
        batch_size: usize,
        label: &str,
        parameters: &[ParameterSpec],
    ) -> ForgeResult<Self> {
        let mut instance = Instance {
            direction,
            buffers: Vec::with_capacity(graph.buffer_count()),
            gradients: Vec::new(),
            open: Vec::new(),
            closed: HashSet::new(),
            finished: HashSet::new(),
        };

        for buffer in graph.buffers() {
            let name = format!("{}.{}:{}", label, direction.tag(), buffer.label());
            match accelerator.allocate(buffer.size() * batch_size, &name) {
                Ok(device) => instance.buffers.push(device),
                Err(e) => {
                    instance.free(accelerator);
                    return Err(e.into());
                }
            }
        }

        if direction == Direction::Backward {
            for spec in parameters {
                let name = format!("{}.grad:{}", label, spec.name);
                match accelerator.allocate(spec.initial.len(), &name) {
                    Ok(device) => instance.gradients.push(device),
                    Err(e) => {
                        instance.free(accelerator);
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(instance)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Clear progress; physical buffers are kept.
    pub fn reset(&mut self) {
        self.open.clear();
        self.closed.clear();
        self.finished.clear();
    }

    /// True when no node is open, closed or finished
    pub fn is_pristine(&self) -> bool {
        self.open.is_empty() && self.closed.is_empty() && self.finished.is_empty()
    }

    /// Push a node onto the open stack unless it is already open or closed.
    pub fn open(&mut self, node: NodeId) -> bool {
        if self.closed.contains(&node) || self.open.contains(&node) {
            return false;
        }
        self.open.push(node);
        true
    }

    /// Most recently opened node
    pub fn pop_open(&mut self) -> Option<NodeId> {
        self.open.pop()
    }

    /// Mark a node dispatched. Returns false if it already was.
    pub fn close(&mut self, node: NodeId) -> bool {
        self.closed.insert(node)
    }

    /// Record a node's completion. Finishing a node that is not closed, or
    /// finishing it twice, is a scheduler defect.
    pub fn finish(&mut self, node: NodeId) -> Result<(), SchedulerError> {
        if !self.closed.contains(&node) {
            return Err(SchedulerError::InvariantViolation(format!(
                "{} finished in {:?} instance without being closed",
                node, self.direction
            )));
        }
        if !self.finished.insert(node) {
            return Err(SchedulerError::InvariantViolation(format!(
                "{} finished twice in {:?} instance",
                node, self.direction
            )));
        }
        Ok(())
    }

    /// Close and finish in one step, for nodes that submit no work
    pub fn settle(&mut self, node: NodeId) -> Result<(), SchedulerError> {
        self.close(node);
        self.finish(node)
    }

    pub fn is_closed(&self, node: NodeId) -> bool {
        self.closed.contains(&node)
    }

    pub fn is_node_finished(&self, node: NodeId) -> bool {
        self.finished.contains(&node)
    }

    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// The traversal is complete: nothing open and every closed node finished.
    pub fn is_finished(&self) -> bool {
        self.open.is_empty() && self.closed.len() == self.finished.len()
    }

    /// Whether `node` may be dispatched in this instance's direction.
    ///
    /// Forward: every producer of its input buffer is closed. Backward: every
    /// consumer of its output buffer is closed.
    pub fn is_ready(&self, graph: &Graph, node: NodeId) -> bool {
        let Some(n) = graph.node(node) else {
            return false;
        };
        match self.direction {
            Direction::Forward => match n.input().and_then(|b| graph.buffer(b)) {
                Some(buffer) => buffer.producers().iter().all(|p| self.closed.contains(p)),
                None => true,
            },
            Direction::Backward => match n.output().and_then(|b| graph.buffer(b)) {
                Some(buffer) => buffer.consumers().iter().all(|c| self.closed.contains(c)),
                None => true,
            },
        }
    }

    /// Nodes adjacent to `node` in traversal order that became ready, in
    /// graph order.
    pub fn ready_successors(&self, graph: &Graph, node: NodeId) -> Vec<NodeId> {
        let Some(n) = graph.node(node) else {
            return Vec::new();
        };
        let candidates = match self.direction {
            Direction::Forward => n
                .output()
                .and_then(|b| graph.buffer(b))
                .map(|b| b.consumers().to_vec()),
            Direction::Backward => n
                .input()
                .and_then(|b| graph.buffer(b))
                .map(|b| b.producers().to_vec()),
        };
        candidates
            .unwrap_or_default()
            .into_iter()
            .filter(|c| !self.closed.contains(c) && self.is_ready(graph, *c))
            .collect()
    }

    /// Physical storage of a graph buffer
    pub fn buffer(&self, id: BufferId) -> Option<&DeviceBuffer> {
        self.buffers.get(id.index())
    }

    pub fn buffers(&self) -> &[DeviceBuffer] {
        &self.buffers
    }

    /// Gradient storage of a parameter; backward instances only
    pub fn gradient(&self, id: ParameterId) -> Option<&DeviceBuffer> {
        self.gradients.get(id.index())
    }

    pub fn gradients(&self) -> &[DeviceBuffer] {
        &self.gradients
    }

    /// Zero every buffer and gradient. Backward kernels accumulate, so this
    /// runs before each training pass.
    pub fn clear(&self, accelerator: &dyn Accelerator) -> ForgeResult<()> {
        for buffer in self.buffers.iter().chain(self.gradients.iter()) {
            accelerator.clear(buffer)?;
        }
        Ok(())
    }

    pub fn free(&mut self, accelerator: &dyn Accelerator) {
        for buffer in self.buffers.drain(..).chain(self.gradients.drain(..)) {
            accelerator.free(&buffer);
        }
    }
}
