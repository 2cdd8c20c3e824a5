//! Fully connected layer: `out = in · W + b`

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::kernels;
use super::{Capabilities, InvocationBuilder, Layer, LayerError, LayerId, LayerProgram};
use crate::backend::{Access, GridSize, Scalar};
use crate::error::ForgeResult;

/// Inner product with weights stored row-major as `input_size x output_size`.
#[derive(Debug)]
pub struct InnerProductLayer {
    id: LayerId,
    name: String,
    input_size: usize,
    output_size: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl InnerProductLayer {
    pub fn new(
        name: impl Into<String>,
        input_size: usize,
        output_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> ForgeResult<Self> {
        let name = name.into();
        if weights.len() != input_size * output_size {
            return Err(LayerError::InvalidParameters {
                layer: name,
                reason: format!(
                    "expected {} weights ({}x{}), got {}",
                    input_size * output_size,
                    input_size,
                    output_size,
                    weights.len()
                ),
            }
            .into());
        }
        if biases.len() != output_size {
            return Err(LayerError::InvalidParameters {
                layer: name,
                reason: format!("expected {} biases, got {}", output_size, biases.len()),
            }
            .into());
        }

        Ok(InnerProductLayer {
            id: LayerId::next(),
            name,
            input_size,
            output_size,
            weights,
            biases,
        })
    }

    /// All-zero weights and biases
    pub fn zeros(name: impl Into<String>, input_size: usize, output_size: usize) -> Self {
        InnerProductLayer {
            id: LayerId::next(),
            name: name.into(),
            input_size,
            output_size,
            weights: vec![0.0; input_size * output_size],
            biases: vec![0.0; output_size],
        }
    }

    /// Uniform Xavier initialization from a fixed seed; biases start at zero
    pub fn seeded(name: impl Into<String>, input_size: usize, output_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let limit = (6.0 / (input_size + output_size).max(1) as f32).sqrt();
        let weights = (0..input_size * output_size)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();

        InnerProductLayer {
            id: LayerId::next(),
            name: name.into(),
            input_size,
            output_size,
            weights,
            biases: vec![0.0; output_size],
        }
    }

    /// Initial weights; trained values live on the accelerator
    pub fn initial_weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn initial_biases(&self) -> &[f32] {
        &self.biases
    }
}

impl Layer for InnerProductLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::transform().with_trainable()
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn initialize(&self, builder: &mut InvocationBuilder<'_>) -> ForgeResult<LayerProgram> {
        let weights = builder.parameter("weights", self.weights.clone())?;
        let biases = builder.parameter("biases", self.biases.clone())?;
        let batch = builder.batch_size();
        let scalars = vec![
            Scalar::U32(batch as u32),
            Scalar::U32(self.input_size as u32),
            Scalar::U32(self.output_size as u32),
        ];
        let grid = GridSize::new(self.output_size, batch);

        let forward = builder.invocation(
            kernels::INNER_PRODUCT_FORWARD,
            vec![
                builder.input()?,
                weights.value(Access::Read),
                biases.value(Access::Read),
                builder.output()?,
            ],
            scalars.clone(),
            grid,
        )?;

        let backward = builder.invocation(
            kernels::INNER_PRODUCT_BACKWARD,
            vec![
                builder.output_deltas()?,
                builder.input()?,
                weights.value(Access::Read),
                builder.input_deltas()?,
                weights.gradient(Access::ReadWrite),
                biases.gradient(Access::ReadWrite),
            ],
            scalars,
            GridSize::new(self.input_size, batch),
        )?;

        Ok(LayerProgram {
            forward: vec![forward],
            backward: vec![backward],
        })
    }
}
