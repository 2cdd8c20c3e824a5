//! Pass-through rewrite placing a transpose node behind every source

use std::sync::Arc;

use super::{Graph, GraphError, GraphResult, Node, NodeId, NodeKind};
use crate::layers::{Layer, TransposeLayer};

impl Graph {
    /// Redirect every wired source into a private staging buffer and insert a
    /// [`TransposeLayer`] node that copies the staging buffer into the source's
    /// old place, rearranged into the feature-major batch layout.
    ///
    /// The transpose node takes the source's position in the producer order,
    /// so offsets and element counts are unchanged. Returns the inserted
    /// nodes; a second call inserts nothing.
    pub fn insert_transpose_nodes(&mut self) -> GraphResult<Vec<NodeId>> {
        self.ensure_unsealed()?;
        if self.transposed {
            return Ok(Vec::new());
        }
        self.transposed = true;

        let mut inserted = Vec::new();
        for source in self.sources.clone() {
            let (target, offset, size, name) = {
                let node = &self.nodes[source.index()];
                match node.output {
                    Some(target) => (
                        target,
                        node.output_offset,
                        node.layer.output_size(),
                        node.name().to_string(),
                    ),
                    None => continue,
                }
            };

            let staging = self.add_buffer_with_size(
                Some(&format!("{}.staging#{}", name, source.index())),
                size,
            )?;

            let layer = Arc::new(TransposeLayer::new(format!("{}.transpose", name), size));
            let transpose = NodeId::from_index(self.nodes.len());
            self.by_layer.insert(layer.id(), transpose);
            let mut node = Node::new(
                transpose,
                layer,
                NodeKind::Transform {
                    loss: false,
                    trainable: false,
                },
            );
            node.input = Some(staging);
            node.input_offset = 0;
            node.output = Some(target);
            node.output_offset = offset;
            self.nodes.push(node);

            if !self.buffers[target.index()].replace_producer(source, transpose) {
                return Err(GraphError::UnknownNode(source));
            }
            self.buffers[staging.index()].reserve_write(source, None, size)?;
            self.buffers[staging.index()].reserve_read(transpose, None, size, false)?;

            let src = &mut self.nodes[source.index()];
            src.output = Some(staging);
            src.output_offset = 0;

            tracing::trace!(
                source = source.index(),
                transpose = transpose.index(),
                staging = staging.index(),
                "transpose inserted"
            );
            inserted.push(transpose);
        }
        Ok(inserted)
    }
}
