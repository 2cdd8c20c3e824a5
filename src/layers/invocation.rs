//! Invocation descriptors and the builder layers use to emit them
//!
//! Bindings name *logical* storage: a graph buffer (forward activations or
//! backward deltas), or a parameter slot. Each execution instance resolves them
//! to its own physical buffers at dispatch time, so one program serves every
//! instance in the pool.

use crate::backend::{Access, Accelerator, BackendError, GridSize, Scalar};
use crate::error::ForgeResult;
use crate::graph::{BufferId, BufferSide, Graph, GraphError, NodeId};

/// Index of a registered parameter within a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(usize);

impl ParameterId {
    pub fn from_index(index: usize) -> Self {
        ParameterId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Logical storage a binding refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingSource {
    /// Forward-instance copy of a graph buffer
    Activations(BufferId),
    /// Backward-instance copy of a graph buffer
    Deltas(BufferId),
    /// Shared parameter values
    Parameter(ParameterId),
    /// Per-backward-instance gradient of a parameter
    Gradient(ParameterId),
    /// Shared momentum history of a parameter
    Velocity(ParameterId),
}

/// A region of logical storage bound to one kernel argument.
/// Offsets and lengths are physical element counts (already scaled by batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub source: BindingSource,
    pub offset: usize,
    pub len: usize,
    pub access: Access,
}

/// One kernel launch described against logical storage
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kernel: String,
    pub bindings: Vec<BufferBinding>,
    pub scalars: Vec<Scalar>,
    pub grid: GridSize,
}

/// Everything a node submits: forward and backward invocations.
/// An empty direction completes immediately without accelerator work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerProgram {
    pub forward: Vec<Invocation>,
    pub backward: Vec<Invocation>,
}

impl LayerProgram {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.backward.is_empty()
    }
}

/// A parameter registered by a layer during initialization
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub id: ParameterId,
    pub node: NodeId,
    pub name: String,
    pub initial: Vec<f32>,
}

/// Returned by [`InvocationBuilder::parameter`]; produces bindings for the
/// parameter's value, gradient and velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterHandle {
    id: ParameterId,
    len: usize,
}

impl ParameterHandle {
    pub fn id(&self) -> ParameterId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn value(&self, access: Access) -> BufferBinding {
        self.whole(BindingSource::Parameter(self.id), access)
    }

    pub fn gradient(&self, access: Access) -> BufferBinding {
        self.whole(BindingSource::Gradient(self.id), access)
    }

    pub fn velocity(&self, access: Access) -> BufferBinding {
        self.whole(BindingSource::Velocity(self.id), access)
    }

    fn whole(&self, source: BindingSource, access: Access) -> BufferBinding {
        BufferBinding {
            source,
            offset: 0,
            len: self.len,
            access,
        }
    }
}

/// Per-node context handed to [`Layer::initialize`](super::Layer::initialize)
pub struct InvocationBuilder<'a> {
    accelerator: &'a dyn Accelerator,
    node: NodeId,
    layer_name: String,
    batch_size: usize,
    input: Option<(BufferId, usize)>,
    output: Option<(BufferId, usize)>,
    input_size: usize,
    output_size: usize,
    parameters: &'a mut Vec<ParameterSpec>,
}

impl<'a> InvocationBuilder<'a> {
    pub(crate) fn for_node(
        graph: &Graph,
        node: NodeId,
        accelerator: &'a dyn Accelerator,
        batch_size: usize,
        parameters: &'a mut Vec<ParameterSpec>,
    ) -> Result<Self, GraphError> {
        let n = graph.node(node).ok_or(GraphError::UnknownNode(node))?;
        Ok(InvocationBuilder {
            accelerator,
            node,
            layer_name: n.name().to_string(),
            batch_size,
            input: n.input().map(|b| (b, n.input_offset())),
            output: n.output().map(|b| (b, n.output_offset())),
            input_size: n.layer().input_size(),
            output_size: n.layer().output_size(),
            parameters,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The node's input region in the forward instance
    pub fn input(&self) -> ForgeResult<BufferBinding> {
        let (buffer, offset) = self.side(BufferSide::Input)?;
        Ok(self.region(BindingSource::Activations(buffer), offset, self.input_size, Access::Read))
    }

    /// The node's output region in the forward instance
    pub fn output(&self) -> ForgeResult<BufferBinding> {
        let (buffer, offset) = self.side(BufferSide::Output)?;
        Ok(self.region(BindingSource::Activations(buffer), offset, self.output_size, Access::Write))
    }

    /// Deltas flowing back into the node's input region; kernels accumulate
    pub fn input_deltas(&self) -> ForgeResult<BufferBinding> {
        let (buffer, offset) = self.side(BufferSide::Input)?;
        Ok(self.region(BindingSource::Deltas(buffer), offset, self.input_size, Access::ReadWrite))
    }

    /// Deltas arriving at the node's output region
    pub fn output_deltas(&self) -> ForgeResult<BufferBinding> {
        let (buffer, offset) = self.side(BufferSide::Output)?;
        Ok(self.region(BindingSource::Deltas(buffer), offset, self.output_size, Access::Read))
    }

    /// Register a trainable parameter with its initial values.
    pub fn parameter(&mut self, name: &str, initial: Vec<f32>) -> ForgeResult<ParameterHandle> {
        if self
            .parameters
            .iter()
            .any(|p| p.node == self.node && p.name == name)
        {
            return Err(super::LayerError::InvalidParameters {
                layer: self.layer_name.clone(),
                reason: format!("parameter '{}' registered twice", name),
            }
            .into());
        }

        let id = ParameterId(self.parameters.len());
        let len = initial.len();
        self.parameters.push(ParameterSpec {
            id,
            node: self.node,
            name: name.to_string(),
            initial,
        });
        Ok(ParameterHandle { id, len })
    }

    /// Describe one kernel launch. Fails when the accelerator lacks the kernel.
    pub fn invocation(
        &self,
        kernel: &str,
        bindings: Vec<BufferBinding>,
        scalars: Vec<Scalar>,
        grid: GridSize,
    ) -> ForgeResult<Invocation> {
        if !self.accelerator.has_kernel(kernel) {
            return Err(BackendError::KernelNotFound(kernel.to_string()).into());
        }
        Ok(Invocation {
            kernel: kernel.to_string(),
            bindings,
            scalars,
            grid,
        })
    }

    fn side(&self, side: BufferSide) -> Result<(BufferId, usize), GraphError> {
        let connection = match side {
            BufferSide::Input => self.input,
            BufferSide::Output => self.output,
        };
        connection.ok_or_else(|| GraphError::MissingBuffer {
            node: self.layer_name.clone(),
            side,
        })
    }

    fn region(&self, source: BindingSource, offset: usize, size: usize, access: Access) -> BufferBinding {
        BufferBinding {
            source,
            offset: offset * self.batch_size,
            len: size * self.batch_size,
            access,
        }
    }
}
