//! Internal pass-through inserted after sources when batching

use super::kernels;
use super::{Capabilities, InvocationBuilder, Layer, LayerId, LayerProgram};
use crate::backend::{GridSize, Scalar};
use crate::error::ForgeResult;

/// Rearranges a source's sample-major batch into the feature-major layout
/// the rest of the graph uses. Forward only: staging buffers carry no deltas.
#[derive(Debug)]
pub struct TransposeLayer {
    id: LayerId,
    name: String,
    size: usize,
}

impl TransposeLayer {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        TransposeLayer {
            id: LayerId::next(),
            name: name.into(),
            size,
        }
    }
}

impl Layer for TransposeLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::transform()
    }

    fn input_size(&self) -> usize {
        self.size
    }

    fn output_size(&self) -> usize {
        self.size
    }

    fn initialize(&self, builder: &mut InvocationBuilder<'_>) -> ForgeResult<LayerProgram> {
        let batch = builder.batch_size();
        let forward = builder.invocation(
            kernels::TRANSPOSE,
            vec![builder.input()?, builder.output()?],
            vec![Scalar::U32(batch as u32), Scalar::U32(self.size as u32)],
            GridSize::new(self.size, batch),
        )?;
        Ok(LayerProgram {
            forward: vec![forward],
            backward: Vec::new(),
        })
    }
}
