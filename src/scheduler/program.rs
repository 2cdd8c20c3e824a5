//! Per-node programs compiled once per runner, and binding resolution

use std::collections::HashSet;

use crate::backend::{Accelerator, BackendError, BoundRegion, Command};
use crate::error::ForgeResult;
use crate::graph::{Graph, NodeId};
use crate::layers::{kernels, BindingSource, Invocation, InvocationBuilder, LayerProgram, ParameterSpec};

use super::instance::{Direction, Instance};
use super::parameters::ParameterStore;

/// Everything the scheduler needs to know about the layers, gathered by
/// running each transform's `initialize` hook once.
#[derive(Debug)]
pub struct Program {
    nodes: Vec<LayerProgram>,
    parameters: Vec<ParameterSpec>,
    backward_inert: Vec<NodeId>,
}

impl Program {
    pub fn compile(
        graph: &Graph,
        accelerator: &dyn Accelerator,
        batch_size: usize,
        training: bool,
    ) -> ForgeResult<Self> {
        let mut parameters = Vec::new();
        let mut nodes = Vec::with_capacity(graph.node_count());

        for node in graph.nodes() {
            if !node.kind().is_transform() {
                nodes.push(LayerProgram::default());
                continue;
            }
            let mut builder =
                InvocationBuilder::for_node(graph, node.id(), accelerator, batch_size, &mut parameters)?;
            let program = node.layer().initialize(&mut builder)?;
            tracing::trace!(
                node = node.id().index(),
                layer = node.name(),
                forward = program.forward.len(),
                backward = program.backward.len(),
                "node compiled"
            );
            nodes.push(program);
        }

        if training && !parameters.is_empty() && !accelerator.has_kernel(kernels::SGD_UPDATE) {
            return Err(BackendError::KernelNotFound(kernels::SGD_UPDATE.to_string()).into());
        }

        Ok(Program {
            nodes,
            parameters,
            backward_inert: backward_inert(graph)?,
        })
    }

    pub fn invocations(&self, node: NodeId, direction: Direction) -> &[Invocation] {
        match self.nodes.get(node.index()) {
            Some(program) => match direction {
                Direction::Forward => &program.forward,
                Direction::Backward => &program.backward,
            },
            None => &[],
        }
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn take_parameters(&mut self) -> Vec<ParameterSpec> {
        std::mem::take(&mut self.parameters)
    }

    /// Transforms from which no loss node is reachable. They receive no
    /// deltas, so backward traversals treat them like sinks.
    pub fn backward_inert(&self) -> &[NodeId] {
        &self.backward_inert
    }
}

fn backward_inert(graph: &Graph) -> ForgeResult<Vec<NodeId>> {
    let order = graph.topological_order()?;
    let mut reaches_loss: HashSet<NodeId> = HashSet::new();

    for id in order.iter().rev() {
        let Some(node) = graph.node(*id) else {
            continue;
        };
        let downstream = node
            .output()
            .and_then(|b| graph.buffer(b))
            .map(|b| b.consumers().iter().any(|c| reaches_loss.contains(c)))
            .unwrap_or(false);
        if node.kind().is_loss() || downstream {
            reaches_loss.insert(*id);
        }
    }

    Ok(graph
        .nodes()
        .filter(|n| n.kind().is_transform() && !reaches_loss.contains(&n.id()))
        .map(|n| n.id())
        .collect())
}

/// Physical storage visible to one slot's work
pub struct Storage<'a> {
    pub forward: &'a Instance,
    pub backward: Option<&'a Instance>,
    pub parameters: &'a ParameterStore,
}

impl Storage<'_> {
    /// Resolve an invocation's logical bindings to this slot's buffers.
    pub fn resolve(&self, invocation: &Invocation) -> Result<Command, String> {
        let mut regions = Vec::with_capacity(invocation.bindings.len());
        for binding in &invocation.bindings {
            let buffer = match binding.source {
                BindingSource::Activations(id) => self.forward.buffer(id),
                BindingSource::Deltas(id) => self.backward.and_then(|b| b.buffer(id)),
                BindingSource::Parameter(id) => self.parameters.value(id),
                BindingSource::Gradient(id) => self.backward.and_then(|b| b.gradient(id)),
                BindingSource::Velocity(id) => self.parameters.velocity(id),
            }
            .ok_or_else(|| {
                format!(
                    "kernel '{}' binds {:?}, which this slot does not hold",
                    invocation.kernel, binding.source
                )
            })?;

            regions.push(BoundRegion {
                buffer: buffer.clone(),
                offset: binding.offset,
                len: binding.len,
                access: binding.access,
            });
        }

        Ok(Command {
            kernel: invocation.kernel.clone(),
            regions,
            scalars: invocation.scalars.clone(),
            grid: invocation.grid,
        })
    }
}
