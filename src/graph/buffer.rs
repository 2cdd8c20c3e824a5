//! Logical buffers: named data slots shared by producer and consumer nodes

use std::fmt;

use super::{GraphError, NodeId};

/// Arena index of a buffer within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn from_index(index: usize) -> Self {
        BufferId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// A logical data slot.
///
/// Producers write disjoint or overlapping regions at offsets handed out by
/// the write cursor; consumers read at offsets handed out by the read cursor
/// (split) or at offset 0 (whole). Sizes are per batch item.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    name: Option<String>,
    declared_size: Option<usize>,
    producers: Vec<NodeId>,
    consumers: Vec<NodeId>,
    write_cursor: usize,
    read_cursor: usize,
    write_extent: usize,
    read_extent: usize,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, name: Option<String>, declared_size: Option<usize>) -> Self {
        Buffer {
            id,
            name,
            declared_size,
            producers: Vec::new(),
            consumers: Vec::new(),
            write_cursor: 0,
            read_cursor: 0,
            write_extent: 0,
            read_extent: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for diagnostics: the given name, or the arena id
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    pub fn declared_size(&self) -> Option<usize> {
        self.declared_size
    }

    /// Elements per batch item: the declared size, or the furthest extent
    /// written or read so far.
    pub fn size(&self) -> usize {
        self.declared_size
            .unwrap_or_else(|| self.write_extent.max(self.read_extent))
    }

    /// Writers in offset-assignment order
    pub fn producers(&self) -> &[NodeId] {
        &self.producers
    }

    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }

    pub fn write_extent(&self) -> usize {
        self.write_extent
    }

    pub fn read_extent(&self) -> usize {
        self.read_extent
    }

    /// Reserve `len` elements for a producer and return its offset.
    pub(crate) fn reserve_write(
        &mut self,
        node: NodeId,
        offset: Option<usize>,
        len: usize,
    ) -> Result<usize, GraphError> {
        let offset = offset.unwrap_or(self.write_cursor);
        let end = self.check_fits(offset, len)?;
        self.write_cursor = self.write_cursor.max(end);
        self.write_extent = self.write_extent.max(end);
        self.producers.push(node);
        Ok(offset)
    }

    /// Reserve `len` elements for a consumer. `advance` is false for whole
    /// (broadcast) reads, which leave the read cursor where it is.
    pub(crate) fn reserve_read(
        &mut self,
        node: NodeId,
        offset: Option<usize>,
        len: usize,
        advance: bool,
    ) -> Result<usize, GraphError> {
        let offset = offset.unwrap_or(self.read_cursor);
        let end = self.check_fits(offset, len)?;
        if advance {
            self.read_cursor = self.read_cursor.max(end);
        }
        self.read_extent = self.read_extent.max(end);
        self.consumers.push(node);
        Ok(offset)
    }

    /// Swap one producer for another, keeping its place in the order
    pub(crate) fn replace_producer(&mut self, old: NodeId, new: NodeId) -> bool {
        match self.producers.iter_mut().find(|p| **p == old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    fn check_fits(&self, offset: usize, len: usize) -> Result<usize, GraphError> {
        let end = offset.checked_add(len).ok_or_else(|| GraphError::BufferOverflow {
            buffer: self.label(),
            end: usize::MAX,
            size: self.size(),
        })?;
        if let Some(size) = self.declared_size {
            if end > size {
                return Err(GraphError::BufferOverflow {
                    buffer: self.label(),
                    end,
                    size,
                });
            }
        }
        Ok(end)
    }
}
