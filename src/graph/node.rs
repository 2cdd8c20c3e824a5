//! Graph nodes and their capability tags

use std::fmt;

use super::{BufferId, BufferSide, GraphError};
use crate::layers::{Capabilities, LayerRef};

/// Arena index of a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        NodeId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// What a node does in a pass, fixed when it is added to the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Produces data from outside the graph; no input buffer
    Source,
    /// Hands data to the outside; no output buffer
    Sink,
    /// Reads its input buffer and writes its output buffer
    Transform { loss: bool, trainable: bool },
}

impl NodeKind {
    /// Validate declared capabilities into exactly one kind.
    pub fn from_capabilities(layer: &str, caps: Capabilities) -> Result<Self, GraphError> {
        let invalid = |reason: &str| GraphError::InvalidCapabilities {
            layer: layer.to_string(),
            reason: reason.to_string(),
        };

        match (caps.source, caps.transform, caps.sink) {
            (false, false, false) => Err(invalid("declares none of source, transform, sink")),
            (true, true, _) => Err(invalid("cannot be both source and transform")),
            (_, true, true) => Err(invalid("cannot be both sink and transform")),
            (true, false, true) => Err(invalid("cannot be both source and sink")),
            (_, false, _) if caps.loss || caps.trainable => {
                Err(invalid("loss and trainable require transform"))
            }
            (true, false, false) => Ok(NodeKind::Source),
            (false, false, true) => Ok(NodeKind::Sink),
            (false, true, false) => Ok(NodeKind::Transform {
                loss: caps.loss,
                trainable: caps.trainable,
            }),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Source)
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, NodeKind::Sink)
    }

    pub fn is_transform(&self) -> bool {
        matches!(self, NodeKind::Transform { .. })
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, NodeKind::Transform { loss: true, .. })
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, NodeKind::Transform { trainable: true, .. })
    }

    /// Whether a node of this kind may be wired on `side`
    pub fn allows(&self, side: BufferSide) -> bool {
        match (self, side) {
            (NodeKind::Source, BufferSide::Input) => false,
            (NodeKind::Sink, BufferSide::Output) => false,
            _ => true,
        }
    }
}

/// One layer placed in the graph, wired by buffer id.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) layer: LayerRef,
    pub(crate) kind: NodeKind,
    pub(crate) input: Option<BufferId>,
    pub(crate) input_offset: usize,
    pub(crate) output: Option<BufferId>,
    pub(crate) output_offset: usize,
}

impl Node {
    pub(crate) fn new(id: NodeId, layer: LayerRef, kind: NodeKind) -> Self {
        Node {
            id,
            layer,
            kind,
            input: None,
            input_offset: 0,
            output: None,
            output_offset: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.layer.name()
    }

    pub fn layer(&self) -> &LayerRef {
        &self.layer
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn input(&self) -> Option<BufferId> {
        self.input
    }

    pub fn input_offset(&self) -> usize {
        self.input_offset
    }

    pub fn output(&self) -> Option<BufferId> {
        self.output
    }

    pub fn output_offset(&self) -> usize {
        self.output_offset
    }

    pub fn buffer(&self, side: BufferSide) -> Option<BufferId> {
        match side {
            BufferSide::Input => self.input,
            BufferSide::Output => self.output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(caps: Capabilities) -> Result<NodeKind, GraphError> {
        NodeKind::from_capabilities("layer", caps)
    }

    #[test]
    fn test_valid_kinds() {
        assert_eq!(kind(Capabilities::source()).unwrap(), NodeKind::Source);
        assert_eq!(kind(Capabilities::sink()).unwrap(), NodeKind::Sink);
        let loss = kind(Capabilities::transform().with_loss()).unwrap();
        assert!(loss.is_loss() && !loss.is_trainable());
        assert!(kind(Capabilities::transform().with_trainable())
            .unwrap()
            .is_trainable());
    }

    #[test]
    fn test_conflicting_capabilities_rejected() {
        let mut both = Capabilities::source();
        both.sink = true;
        assert!(kind(both).is_err());

        let mut source_transform = Capabilities::transform();
        source_transform.source = true;
        assert!(kind(source_transform).is_err());

        let mut sink_transform = Capabilities::transform();
        sink_transform.sink = true;
        assert!(kind(sink_transform).is_err());

        assert!(kind(Capabilities::default()).is_err());
        assert!(kind(Capabilities::source().with_loss()).is_err());
        assert!(kind(Capabilities::sink().with_trainable()).is_err());
    }

    #[test]
    fn test_allowed_sides() {
        assert!(!NodeKind::Source.allows(BufferSide::Input));
        assert!(NodeKind::Source.allows(BufferSide::Output));
        assert!(!NodeKind::Sink.allows(BufferSide::Output));
        let t = NodeKind::Transform {
            loss: false,
            trainable: false,
        };
        assert!(t.allows(BufferSide::Input) && t.allows(BufferSide::Output));
    }
}
