//! Computation graph: an arena of buffers and nodes addressed by id
//!
//! Nodes and buffers refer to each other only through [`NodeId`] and
//! [`BufferId`]; the [`Graph`] owns both. Capabilities are validated once when
//! a layer is added and cached as a [`NodeKind`]. A sealed graph is immutable
//! and is what a runner executes.

pub mod buffer;
pub mod builder;
pub mod node;
mod transpose;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::layers::{LayerId, LayerRef};

pub use buffer::{Buffer, BufferId};
pub use builder::GraphBuilder;
pub use node::{Node, NodeId, NodeKind};

/// Graph construction errors. All are fatal: fix the graph and rebuild.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("layer '{layer}' has invalid capabilities: {reason}")]
    InvalidCapabilities { layer: String, reason: String },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown buffer: {0}")]
    UnknownBuffer(BufferId),

    #[error("buffer name '{0}' is already in use")]
    DuplicateBufferName(String),

    #[error("node '{node}' cannot be connected on its {side} side")]
    WrongDirection { node: String, side: BufferSide },

    #[error("node '{node}' already has an {side} buffer ({existing})")]
    AlreadyConnected {
        node: String,
        side: BufferSide,
        existing: BufferId,
    },

    #[error("buffer '{buffer}' overflows: access ends at {end}, size is {size}")]
    BufferOverflow {
        buffer: String,
        end: usize,
        size: usize,
    },

    #[error("buffer '{buffer}' is written over {written} elements but read over {read}")]
    SizeMismatch {
        buffer: String,
        written: usize,
        read: usize,
    },

    #[error("node '{node}' has no {side} buffer")]
    MissingBuffer { node: String, side: BufferSide },

    #[error("buffer '{buffer}' is read but never written")]
    NoProducers { buffer: String },

    #[error("graph has a cycle through node '{node}'")]
    Cycle { node: String },

    #[error("graph has no nodes")]
    Empty,

    #[error("graph is sealed")]
    Sealed,
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Which of a node's two buffer slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSide {
    Input,
    Output,
}

impl fmt::Display for BufferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSide::Input => f.write_str("input"),
            BufferSide::Output => f.write_str("output"),
        }
    }
}

/// How a node attaches to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRole {
    /// Write at the buffer's write cursor, then advance it
    Produces,
    /// Write at an explicit offset
    ProducesAt(usize),
    /// Read at the buffer's read cursor, then advance it
    ConsumesSplit,
    /// Read from offset 0 without moving the cursor (broadcast)
    ConsumesWhole,
    /// Read at an explicit offset
    ConsumesAt(usize),
}

impl ConnectRole {
    pub fn side(&self) -> BufferSide {
        match self {
            ConnectRole::Produces | ConnectRole::ProducesAt(_) => BufferSide::Output,
            _ => BufferSide::Input,
        }
    }
}

/// Owner of every buffer and node
#[derive(Debug, Clone, Default)]
pub struct Graph {
    buffers: Vec<Buffer>,
    nodes: Vec<Node>,
    by_layer: HashMap<LayerId, NodeId>,
    by_name: HashMap<String, BufferId>,
    sources: Vec<NodeId>,
    sinks: Vec<NodeId>,
    losses: Vec<NodeId>,
    trainables: Vec<NodeId>,
    transposed: bool,
    sealed: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, name: Option<&str>) -> GraphResult<BufferId> {
        self.insert_buffer(name, None)
    }

    /// Buffer with a fixed size; accesses beyond it fail at connect time.
    pub fn add_buffer_with_size(&mut self, name: Option<&str>, size: usize) -> GraphResult<BufferId> {
        self.insert_buffer(name, Some(size))
    }

    fn insert_buffer(&mut self, name: Option<&str>, size: Option<usize>) -> GraphResult<BufferId> {
        self.ensure_unsealed()?;
        let id = BufferId::from_index(self.buffers.len());
        if let Some(name) = name {
            if self.by_name.contains_key(name) {
                return Err(GraphError::DuplicateBufferName(name.to_string()));
            }
            self.by_name.insert(name.to_string(), id);
        }
        self.buffers.push(Buffer::new(id, name.map(str::to_string), size));
        Ok(id)
    }

    /// Add a node wrapping `layer`. Adding the same layer again returns the
    /// existing node.
    pub fn add_node(&mut self, layer: LayerRef) -> GraphResult<NodeId> {
        if let Some(existing) = self.by_layer.get(&layer.id()) {
            return Ok(*existing);
        }
        self.ensure_unsealed()?;

        let kind = NodeKind::from_capabilities(layer.name(), layer.capabilities())?;
        let id = NodeId::from_index(self.nodes.len());
        self.by_layer.insert(layer.id(), id);

        match kind {
            NodeKind::Source => self.sources.push(id),
            NodeKind::Sink => self.sinks.push(id),
            NodeKind::Transform { loss, trainable } => {
                if loss {
                    self.losses.push(id);
                }
                if trainable {
                    self.trainables.push(id);
                }
            }
        }

        tracing::trace!(node = id.index(), layer = layer.name(), ?kind, "node added");
        self.nodes.push(Node::new(id, layer, kind));
        Ok(id)
    }

    /// Attach `node` to `buffer`. Returns the element offset assigned.
    pub fn connect(&mut self, node: NodeId, buffer: BufferId, role: ConnectRole) -> GraphResult<usize> {
        self.ensure_unsealed()?;
        if buffer.index() >= self.buffers.len() {
            return Err(GraphError::UnknownBuffer(buffer));
        }
        let n = self.nodes.get(node.index()).ok_or(GraphError::UnknownNode(node))?;
        let side = role.side();

        if !n.kind.allows(side) {
            return Err(GraphError::WrongDirection {
                node: n.name().to_string(),
                side,
            });
        }
        if let Some(existing) = n.buffer(side) {
            return Err(GraphError::AlreadyConnected {
                node: n.name().to_string(),
                side,
                existing,
            });
        }

        let len = match side {
            BufferSide::Input => n.layer.input_size(),
            BufferSide::Output => n.layer.output_size(),
        };
        let target = &mut self.buffers[buffer.index()];
        let offset = match role {
            ConnectRole::Produces => target.reserve_write(node, None, len)?,
            ConnectRole::ProducesAt(at) => target.reserve_write(node, Some(at), len)?,
            ConnectRole::ConsumesSplit => target.reserve_read(node, None, len, true)?,
            ConnectRole::ConsumesWhole => target.reserve_read(node, Some(0), len, false)?,
            ConnectRole::ConsumesAt(at) => target.reserve_read(node, Some(at), len, true)?,
        };

        let n = &mut self.nodes[node.index()];
        match side {
            BufferSide::Input => {
                n.input = Some(buffer);
                n.input_offset = offset;
            }
            BufferSide::Output => {
                n.output = Some(buffer);
                n.output_offset = offset;
            }
        }
        Ok(offset)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.index())
    }

    pub fn buffer_named(&self, name: &str) -> Option<BufferId> {
        self.by_name.get(name).copied()
    }

    pub fn node_for_layer(&self, layer: LayerId) -> Option<NodeId> {
        self.by_layer.get(&layer).copied()
    }

    /// First node whose layer carries `name`
    pub fn node_named(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name() == name).map(|n| n.id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn source_nodes(&self) -> &[NodeId] {
        &self.sources
    }

    pub fn sink_nodes(&self) -> &[NodeId] {
        &self.sinks
    }

    pub fn loss_nodes(&self) -> &[NodeId] {
        &self.losses
    }

    pub fn trainable_nodes(&self) -> &[NodeId] {
        &self.trainables
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Check that every node is fully wired and every buffer is consistent.
    pub fn validate(&self) -> GraphResult<()> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        for node in &self.nodes {
            let required: &[BufferSide] = match node.kind {
                NodeKind::Source => &[BufferSide::Output],
                NodeKind::Sink => &[BufferSide::Input],
                NodeKind::Transform { .. } => &[BufferSide::Input, BufferSide::Output],
            };
            for side in required {
                if node.buffer(*side).is_none() {
                    return Err(GraphError::MissingBuffer {
                        node: node.name().to_string(),
                        side: *side,
                    });
                }
            }
        }

        for buffer in &self.buffers {
            if buffer.producers().is_empty() && !buffer.consumers().is_empty() {
                return Err(GraphError::NoProducers {
                    buffer: buffer.label(),
                });
            }
            if buffer.declared_size().is_none()
                && !buffer.producers().is_empty()
                && !buffer.consumers().is_empty()
                && buffer.write_extent() != buffer.read_extent()
            {
                return Err(GraphError::SizeMismatch {
                    buffer: buffer.label(),
                    written: buffer.write_extent(),
                    read: buffer.read_extent(),
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Nodes ordered so every producer of a node's input comes before it.
    pub fn topological_order(&self) -> GraphResult<Vec<NodeId>> {
        let mut pending: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| {
                n.input
                    .and_then(|b| self.buffer(b))
                    .map_or(0, |b| b.producers().len())
            })
            .collect();
        let mut ready: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| pending[n.id.index()] == 0)
            .map(|n| n.id)
            .collect();
        ready.reverse();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            let consumers = self.nodes[id.index()]
                .output
                .and_then(|b| self.buffer(b))
                .map(|b| b.consumers())
                .unwrap_or(&[]);
            for consumer in consumers {
                let count = &mut pending[consumer.index()];
                *count -= 1;
                if *count == 0 {
                    ready.push(*consumer);
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| pending[n.id.index()] > 0)
                .map(|n| n.name().to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle { node: stuck });
        }
        Ok(order)
    }

    /// Validate and freeze the topology. Sealing twice is a no-op.
    pub fn seal(&mut self) -> GraphResult<()> {
        if self.sealed {
            return Ok(());
        }
        self.validate()?;
        self.sealed = true;
        tracing::debug!(
            nodes = self.nodes.len(),
            buffers = self.buffers.len(),
            sources = self.sources.len(),
            sinks = self.sinks.len(),
            losses = self.losses.len(),
            "graph sealed"
        );
        Ok(())
    }

    fn ensure_unsealed(&self) -> GraphResult<()> {
        if self.sealed {
            Err(GraphError::Sealed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{CollectSink, DataSource, InnerProductLayer, ReluLayer};
    use std::sync::Arc;

    fn source(name: &str, size: usize) -> LayerRef {
        Arc::new(DataSource::new(name, size, vec![0.0; size]))
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut graph = Graph::new();
        let layer = source("x", 2);
        let a = graph.add_node(Arc::clone(&layer)).unwrap();
        let b = graph.add_node(layer).unwrap();
        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.source_nodes(), &[a]);
    }

    #[test]
    fn test_derived_indices() {
        let mut graph = Graph::new();
        let s = graph.add_node(source("x", 1)).unwrap();
        let ip = graph
            .add_node(Arc::new(InnerProductLayer::zeros("ip", 1, 1)))
            .unwrap();
        let loss = graph
            .add_node(Arc::new(crate::layers::L2LossLayer::new("loss", 1)))
            .unwrap();
        let k = graph.add_node(Arc::new(CollectSink::new("y", 1))).unwrap();

        assert_eq!(graph.source_nodes(), &[s]);
        assert_eq!(graph.sink_nodes(), &[k]);
        assert_eq!(graph.loss_nodes(), &[loss]);
        assert_eq!(graph.trainable_nodes(), &[ip]);
    }

    #[test]
    fn test_connect_rejects_wrong_direction_and_rewiring() {
        let mut graph = Graph::new();
        let s = graph.add_node(source("x", 2)).unwrap();
        let k = graph.add_node(Arc::new(CollectSink::new("y", 2))).unwrap();
        let a = graph.add_buffer(Some("a")).unwrap();
        let b = graph.add_buffer(None).unwrap();

        assert!(matches!(
            graph.connect(s, a, ConnectRole::ConsumesSplit),
            Err(GraphError::WrongDirection { .. })
        ));
        assert!(matches!(
            graph.connect(k, a, ConnectRole::Produces),
            Err(GraphError::WrongDirection { .. })
        ));

        graph.connect(s, a, ConnectRole::Produces).unwrap();
        assert_eq!(
            graph.connect(s, b, ConnectRole::Produces),
            Err(GraphError::AlreadyConnected {
                node: "x".into(),
                side: BufferSide::Output,
                existing: a
            })
        );
        assert_eq!(
            graph.connect(s, BufferId::from_index(9), ConnectRole::Produces),
            Err(GraphError::UnknownBuffer(BufferId::from_index(9)))
        );
    }

    #[test]
    fn test_duplicate_buffer_name() {
        let mut graph = Graph::new();
        graph.add_buffer(Some("h")).unwrap();
        assert_eq!(
            graph.add_buffer(Some("h")),
            Err(GraphError::DuplicateBufferName("h".into()))
        );
        assert!(graph.buffer_named("h").is_some());
    }

    #[test]
    fn test_declared_size_overflow_is_eager() {
        let mut graph = Graph::new();
        let s = graph.add_node(source("x", 3)).unwrap();
        let small = graph.add_buffer_with_size(None, 2).unwrap();
        assert!(matches!(
            graph.connect(s, small, ConnectRole::Produces),
            Err(GraphError::BufferOverflow { end: 3, size: 2, .. })
        ));
    }

    #[test]
    fn test_seal_validation() {
        let mut graph = Graph::new();
        assert_eq!(graph.seal(), Err(GraphError::Empty));

        let s = graph.add_node(source("x", 2)).unwrap();
        let relu = graph.add_node(Arc::new(ReluLayer::new("relu", 3))).unwrap();
        let buf = graph.add_buffer(None).unwrap();
        graph.connect(s, buf, ConnectRole::Produces).unwrap();
        graph.connect(relu, buf, ConnectRole::ConsumesSplit).unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::MissingBuffer { .. })));

        let out = graph.add_buffer(None).unwrap();
        graph.connect(relu, out, ConnectRole::Produces).unwrap();
        assert_eq!(
            graph.validate(),
            Err(GraphError::SizeMismatch {
                buffer: buf.to_string(),
                written: 2,
                read: 3
            })
        );
    }

    #[test]
    fn test_sealed_graph_is_immutable() {
        let mut graph = Graph::new();
        let s = graph.add_node(source("x", 1)).unwrap();
        let k = graph.add_node(Arc::new(CollectSink::new("y", 1))).unwrap();
        let buf = graph.add_buffer(None).unwrap();
        graph.connect(s, buf, ConnectRole::Produces).unwrap();
        graph.connect(k, buf, ConnectRole::ConsumesSplit).unwrap();
        graph.seal().unwrap();
        assert!(graph.is_sealed());
        assert!(graph.seal().is_ok());

        assert_eq!(graph.add_buffer(None), Err(GraphError::Sealed));
        assert_eq!(graph.add_node(source("z", 1)), Err(GraphError::Sealed));
        assert_eq!(
            graph.connect(k, buf, ConnectRole::ConsumesWhole),
            Err(GraphError::Sealed)
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = Graph::new();
        let r1 = graph.add_node(Arc::new(ReluLayer::new("r1", 1))).unwrap();
        let r2 = graph.add_node(Arc::new(ReluLayer::new("r2", 1))).unwrap();
        let x = graph.add_buffer(None).unwrap();
        let y = graph.add_buffer(None).unwrap();
        graph.connect(r1, x, ConnectRole::Produces).unwrap();
        graph.connect(r2, x, ConnectRole::ConsumesSplit).unwrap();
        graph.connect(r2, y, ConnectRole::Produces).unwrap();
        graph.connect(r1, y, ConnectRole::ConsumesSplit).unwrap();
        assert!(matches!(graph.seal(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_topological_order_respects_producers() {
        let mut graph = Graph::new();
        let k = graph.add_node(Arc::new(CollectSink::new("y", 2))).unwrap();
        let r = graph.add_node(Arc::new(ReluLayer::new("r", 2))).unwrap();
        let s = graph.add_node(source("x", 2)).unwrap();
        let a = graph.add_buffer(None).unwrap();
        let b = graph.add_buffer(None).unwrap();
        graph.connect(s, a, ConnectRole::Produces).unwrap();
        graph.connect(r, a, ConnectRole::ConsumesSplit).unwrap();
        graph.connect(r, b, ConnectRole::Produces).unwrap();
        graph.connect(k, b, ConnectRole::ConsumesSplit).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![s, r, k]);
    }

    #[test]
    fn test_read_without_writer_rejected() {
        let mut graph = Graph::new();
        let k = graph.add_node(Arc::new(CollectSink::new("y", 1))).unwrap();
        let buf = graph.add_buffer(Some("orphan")).unwrap();
        graph.connect(k, buf, ConnectRole::ConsumesSplit).unwrap();
        assert_eq!(
            graph.validate(),
            Err(GraphError::NoProducers {
                buffer: "orphan".into()
            })
        );
    }
}
