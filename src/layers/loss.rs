//! Squared-error loss

use super::kernels;
use super::{Capabilities, InvocationBuilder, Layer, LayerId, LayerProgram};
use crate::backend::{GridSize, Scalar};
use crate::error::ForgeResult;

/// L2 loss over `size` predictions.
///
/// The input region holds the predictions followed by the labels, so it is
/// `2 * size` wide; the usual wiring joins the prediction node and a label
/// source into one buffer. The output is one value per batch item, scaled so
/// that summing over the batch gives `mean(0.5 * |x - y|^2)`.
#[derive(Debug)]
pub struct L2LossLayer {
    id: LayerId,
    name: String,
    size: usize,
}

impl L2LossLayer {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        L2LossLayer {
            id: LayerId::next(),
            name: name.into(),
            size,
        }
    }
}

impl Layer for L2LossLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::transform().with_loss()
    }

    fn input_size(&self) -> usize {
        2 * self.size
    }

    fn output_size(&self) -> usize {
        1
    }

    fn initialize(&self, builder: &mut InvocationBuilder<'_>) -> ForgeResult<LayerProgram> {
        let batch = builder.batch_size();
        let scalars = vec![Scalar::U32(batch as u32), Scalar::U32(self.size as u32)];
        let grid = GridSize::new(self.size, batch);

        Ok(LayerProgram {
            forward: vec![builder.invocation(
                kernels::L2_LOSS_FORWARD,
                vec![builder.input()?, builder.output()?],
                scalars.clone(),
                grid,
            )?],
            backward: vec![builder.invocation(
                kernels::L2_LOSS_BACKWARD,
                vec![builder.input()?, builder.input_deltas()?],
                scalars,
                grid,
            )?],
        })
    }
}
