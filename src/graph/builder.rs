//! Explicit builder over the core connect operations

use std::sync::Arc;

use super::{BufferId, BufferSide, ConnectRole, Graph, GraphError, GraphResult, NodeId};
use crate::layers::{Layer, LayerRef};

/// Graph under construction.
///
/// `link` mirrors a chaining operator: it reuses whichever side is already
/// wired and creates a buffer only when neither is.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue building on an existing, unsealed graph
    pub fn from_graph(graph: Graph) -> Self {
        GraphBuilder { graph }
    }

    pub fn add<L: Layer + 'static>(&mut self, layer: &Arc<L>) -> GraphResult<NodeId> {
        let layer: LayerRef = Arc::clone(layer) as LayerRef;
        self.graph.add_node(layer)
    }

    pub fn add_ref(&mut self, layer: LayerRef) -> GraphResult<NodeId> {
        self.graph.add_node(layer)
    }

    /// Buffer with this name, created on first use
    pub fn buffer_named(&mut self, name: &str) -> GraphResult<BufferId> {
        match self.graph.buffer_named(name) {
            Some(id) => Ok(id),
            None => self.graph.add_buffer(Some(name)),
        }
    }

    pub fn buffer_with_size(&mut self, name: Option<&str>, size: usize) -> GraphResult<BufferId> {
        self.graph.add_buffer_with_size(name, size)
    }

    pub fn connect(&mut self, node: NodeId, buffer: BufferId, role: ConnectRole) -> GraphResult<usize> {
        self.graph.connect(node, buffer, role)
    }

    /// `a => b`: split-connect `b` to `a`'s output.
    pub fn link(&mut self, a: NodeId, b: NodeId) -> GraphResult<BufferId> {
        self.link_with(a, b, ConnectRole::ConsumesSplit)
    }

    /// `a =>> b`: `b` reads the whole of `a`'s output buffer.
    pub fn link_whole(&mut self, a: NodeId, b: NodeId) -> GraphResult<BufferId> {
        self.link_with(a, b, ConnectRole::ConsumesWhole)
    }

    /// Concatenate the outputs of `inputs`, in order, into `target`'s input.
    pub fn join(&mut self, inputs: &[NodeId], target: NodeId) -> GraphResult<BufferId> {
        let wired = self.side(target, BufferSide::Input)?;
        let buffer = match wired {
            Some(existing) => existing,
            None => self.graph.add_buffer(None)?,
        };
        for input in inputs {
            self.produce_into(*input, buffer)?;
        }
        if wired.is_none() {
            self.graph.connect(target, buffer, ConnectRole::ConsumesSplit)?;
        }
        Ok(buffer)
    }

    /// Partition `source`'s output across `outputs`, in order.
    pub fn split(&mut self, source: NodeId, outputs: &[NodeId]) -> GraphResult<BufferId> {
        let buffer = match self.side(source, BufferSide::Output)? {
            Some(existing) => existing,
            None => {
                let buffer = self.graph.add_buffer(None)?;
                self.graph.connect(source, buffer, ConnectRole::Produces)?;
                buffer
            }
        };
        for output in outputs {
            match self.side(*output, BufferSide::Input)? {
                Some(existing) if existing == buffer => {}
                _ => {
                    self.graph.connect(*output, buffer, ConnectRole::ConsumesSplit)?;
                }
            }
        }
        Ok(buffer)
    }

    /// Link each consecutive pair.
    pub fn chain(&mut self, nodes: &[NodeId]) -> GraphResult<()> {
        for pair in nodes.windows(2) {
            self.link(pair[0], pair[1])?;
        }
        Ok(())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    fn link_with(&mut self, a: NodeId, b: NodeId, read: ConnectRole) -> GraphResult<BufferId> {
        let out = self.side(a, BufferSide::Output)?;
        let input = self.side(b, BufferSide::Input)?;
        match (out, input) {
            (Some(x), Some(y)) if x == y => Ok(x),
            (Some(_), Some(y)) => Err(GraphError::AlreadyConnected {
                node: self.name(b),
                side: BufferSide::Input,
                existing: y,
            }),
            (Some(x), None) => {
                self.graph.connect(b, x, read)?;
                Ok(x)
            }
            (None, Some(y)) => {
                self.graph.connect(a, y, ConnectRole::Produces)?;
                Ok(y)
            }
            (None, None) => {
                let buffer = self.graph.add_buffer(None)?;
                self.graph.connect(a, buffer, ConnectRole::Produces)?;
                self.graph.connect(b, buffer, read)?;
                Ok(buffer)
            }
        }
    }

    fn produce_into(&mut self, node: NodeId, buffer: BufferId) -> GraphResult<()> {
        match self.side(node, BufferSide::Output)? {
            Some(existing) if existing == buffer => Ok(()),
            _ => self
                .graph
                .connect(node, buffer, ConnectRole::Produces)
                .map(|_| ()),
        }
    }

    fn side(&self, node: NodeId, side: BufferSide) -> GraphResult<Option<BufferId>> {
        self.graph
            .node(node)
            .map(|n| n.buffer(side))
            .ok_or(GraphError::UnknownNode(node))
    }

    fn name(&self, node: NodeId) -> String {
        self.graph
            .node(node)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| node.to_string())
    }
}
