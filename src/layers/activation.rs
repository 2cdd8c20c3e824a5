//! Elementwise activations

use super::kernels;
use super::{Capabilities, InvocationBuilder, Layer, LayerId, LayerProgram};
use crate::backend::{GridSize, Scalar};
use crate::error::ForgeResult;

/// Rectifier with an optional leak for negative inputs
#[derive(Debug)]
pub struct ReluLayer {
    id: LayerId,
    name: String,
    size: usize,
    negative_slope: f32,
}

impl ReluLayer {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::leaky(name, size, 0.0)
    }

    pub fn leaky(name: impl Into<String>, size: usize, negative_slope: f32) -> Self {
        ReluLayer {
            id: LayerId::next(),
            name: name.into(),
            size,
            negative_slope,
        }
    }
}

impl Layer for ReluLayer {
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
        let grid = GridSize::new(self.size, builder.batch_size());
        let slope = vec![Scalar::F32(self.negative_slope)];
        Ok(LayerProgram {
            forward: vec![builder.invocation(
                kernels::RELU_FORWARD,
                vec![builder.input()?, builder.output()?],
                slope.clone(),
                grid,
            )?],
            backward: vec![builder.invocation(
                kernels::RELU_BACKWARD,
                vec![
                    builder.output_deltas()?,
                    builder.input()?,
                    builder.input_deltas()?,
                ],
                slope,
                grid,
            )?],
        })
    }
}

/// Logistic sigmoid
#[derive(Debug)]
pub struct SigmoidLayer {
    id: LayerId,
    name: String,
    size: usize,
}

impl SigmoidLayer {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        SigmoidLayer {
            id: LayerId::next(),
            name: name.into(),
            size,
        }
    }
}

impl Layer for SigmoidLayer {
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
        let grid = GridSize::new(self.size, builder.batch_size());
        Ok(LayerProgram {
            forward: vec![builder.invocation(
                kernels::SIGMOID_FORWARD,
                vec![builder.input()?, builder.output()?],
                vec![],
                grid,
            )?],
            backward: vec![builder.invocation(
                kernels::SIGMOID_BACKWARD,
                vec![
                    builder.output_deltas()?,
                    builder.input()?,
                    builder.input_deltas()?,
                ],
                vec![],
                grid,
            )?],
        })
    }
}
