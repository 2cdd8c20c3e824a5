//! Host implementations of the reference kernels
//!
//! Every kernel receives copies of its bound regions in binding order and
//! writes results into the same vectors; the stream writes back regions bound
//! with write access. Buffers are feature-major (see [`crate::layout`]).

use std::collections::HashMap;

use crate::backend::Scalar;
use crate::layers::kernels as names;
use crate::layout;

/// Arguments of one kernel launch
pub(crate) struct KernelArgs<'a> {
    pub regions: Vec<Vec<f32>>,
    pub scalars: &'a [Scalar],
}

impl<'a> KernelArgs<'a> {
    fn count(&self, index: usize) -> Result<usize, String> {
        match self.scalars.get(index) {
            Some(Scalar::U32(v)) => Ok(*v as usize),
            other => Err(format!("scalar {} must be u32, got {:?}", index, other)),
        }
    }

    fn real(&self, index: usize) -> Result<f32, String> {
        match self.scalars.get(index) {
            Some(Scalar::F32(v)) => Ok(*v),
            other => Err(format!("scalar {} must be f32, got {:?}", index, other)),
        }
    }

    fn expect_regions(&self, count: usize) -> Result<(), String> {
        if self.regions.len() != count {
            return Err(format!(
                "expected {} bound regions, got {}",
                count,
                self.regions.len()
            ));
        }
        Ok(())
    }

    fn expect_len(&self, index: usize, len: usize) -> Result<(), String> {
        let actual = self.regions[index].len();
        if actual != len {
            return Err(format!(
                "region {} has {} elements, expected {}",
                index, actual, len
            ));
        }
        Ok(())
    }

    fn expect_same_len(&self, a: usize, b: usize) -> Result<(), String> {
        self.expect_len(b, self.regions[a].len())
    }
}

pub(crate) type KernelFn = fn(&mut KernelArgs<'_>) -> Result<(), String>;

pub(crate) fn registry() -> HashMap<&'static str, KernelFn> {
    let mut kernels: HashMap<&'static str, KernelFn> = HashMap::new();
    kernels.insert(names::INNER_PRODUCT_FORWARD, inner_product_forward);
    kernels.insert(names::INNER_PRODUCT_BACKWARD, inner_product_backward);
    kernels.insert(names::RELU_FORWARD, relu_forward);
    kernels.insert(names::RELU_BACKWARD, relu_backward);
    kernels.insert(names::SIGMOID_FORWARD, sigmoid_forward);
    kernels.insert(names::SIGMOID_BACKWARD, sigmoid_backward);
    kernels.insert(names::L2_LOSS_FORWARD, l2_loss_forward);
    kernels.insert(names::L2_LOSS_BACKWARD, l2_loss_backward);
    kernels.insert(names::TRANSPOSE, transpose);
    kernels.insert(names::SGD_UPDATE, sgd_update);
    kernels
}

/// `out[j, b] = bias[j] + sum_i in[i, b] * w[i, j]`, weights row-major `inputs x outputs`
fn inner_product_forward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(4)?;
    let (batch, inputs, outputs) = (args.count(0)?, args.count(1)?, args.count(2)?);
    args.expect_len(0, inputs * batch)?;
    args.expect_len(1, inputs * outputs)?;
    args.expect_len(2, outputs)?;
    args.expect_len(3, outputs * batch)?;

    let result = {
        let (input, weights, biases) = (&args.regions[0], &args.regions[1], &args.regions[2]);
        let mut out = vec![0.0; outputs * batch];
        for j in 0..outputs {
            for b in 0..batch {
                let mut acc = biases[j];
                for i in 0..inputs {
                    acc += input[i * batch + b] * weights[i * outputs + j];
                }
                out[j * batch + b] = acc;
            }
        }
        out
    };
    args.regions[3] = result;
    Ok(())
}

fn inner_product_backward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(6)?;
    let (batch, inputs, outputs) = (args.count(0)?, args.count(1)?, args.count(2)?);
    args.expect_len(0, outputs * batch)?;
    args.expect_len(1, inputs * batch)?;
    args.expect_len(2, inputs * outputs)?;
    args.expect_len(3, inputs * batch)?;
    args.expect_len(4, inputs * outputs)?;
    args.expect_len(5, outputs)?;

    let mut input_deltas = std::mem::take(&mut args.regions[3]);
    let mut weight_grad = std::mem::take(&mut args.regions[4]);
    let mut bias_grad = std::mem::take(&mut args.regions[5]);
    {
        let (deltas, input, weights) = (&args.regions[0], &args.regions[1], &args.regions[2]);
        for b in 0..batch {
            for j in 0..outputs {
                let d = deltas[j * batch + b];
                bias_grad[j] += d;
                for i in 0..inputs {
                    weight_grad[i * outputs + j] += d * input[i * batch + b];
                    input_deltas[i * batch + b] += d * weights[i * outputs + j];
                }
            }
        }
    }
    args.regions[3] = input_deltas;
    args.regions[4] = weight_grad;
    args.regions[5] = bias_grad;
    Ok(())
}

fn relu_forward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(2)?;
    args.expect_same_len(0, 1)?;
    let slope = args.real(0)?;
    let out = args.regions[0]
        .iter()
        .map(|&x| if x > 0.0 { x } else { x * slope })
        .collect();
    args.regions[1] = out;
    Ok(())
}

fn relu_backward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(3)?;
    args.expect_same_len(0, 1)?;
    args.expect_same_len(0, 2)?;
    let slope = args.real(0)?;
    let mut input_deltas = std::mem::take(&mut args.regions[2]);
    for (k, acc) in input_deltas.iter_mut().enumerate() {
        let gate = if args.regions[1][k] > 0.0 { 1.0 } else { slope };
        *acc += args.regions[0][k] * gate;
    }
    args.regions[2] = input_deltas;
    Ok(())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn sigmoid_forward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(2)?;
    args.expect_same_len(0, 1)?;
    let out = args.regions[0].iter().map(|&x| sigmoid(x)).collect();
    args.regions[1] = out;
    Ok(())
}

fn sigmoid_backward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(3)?;
    args.expect_same_len(0, 1)?;
    args.expect_same_len(0, 2)?;
    let mut input_deltas = std::mem::take(&mut args.regions[2]);
    for (k, acc) in input_deltas.iter_mut().enumerate() {
        let s = sigmoid(args.regions[1][k]);
        *acc += args.regions[0][k] * s * (1.0 - s);
    }
    args.regions[2] = input_deltas;
    Ok(())
}

/// Per batch item: `0.5 * sum_i (x - y)^2 / batch`, so summing the output
/// over the batch gives the mean loss.
fn l2_loss_forward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(2)?;
    let (batch, size) = (args.count(0)?, args.count(1)?);
    args.expect_len(0, 2 * size * batch)?;
    args.expect_len(1, batch)?;
    let scale = 1.0 / batch.max(1) as f32;

    let out = {
        let input = &args.regions[0];
        (0..batch)
            .map(|b| {
                let sum: f32 = (0..size)
                    .map(|i| {
                        let diff = input[i * batch + b] - input[(size + i) * batch + b];
                        diff * diff
                    })
                    .sum();
                0.5 * sum * scale
            })
            .collect()
    };
    args.regions[1] = out;
    Ok(())
}

fn l2_loss_backward(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(2)?;
    let (batch, size) = (args.count(0)?, args.count(1)?);
    args.expect_len(0, 2 * size * batch)?;
    args.expect_len(1, 2 * size * batch)?;
    let scale = 1.0 / batch.max(1) as f32;

    let mut deltas = std::mem::take(&mut args.regions[1]);
    let input = &args.regions[0];
    for i in 0..size {
        for b in 0..batch {
            let prediction = i * batch + b;
            let label = (size + i) * batch + b;
            let diff = (input[prediction] - input[label]) * scale;
            deltas[prediction] += diff;
            deltas[label] -= diff;
        }
    }
    args.regions[1] = deltas;
    Ok(())
}

fn transpose(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(2)?;
    let (batch, size) = (args.count(0)?, args.count(1)?);
    args.expect_len(0, size * batch)?;
    args.expect_len(1, size * batch)?;
    let out = layout::to_feature_major(&args.regions[0], size, batch);
    args.regions[1] = out;
    Ok(())
}

/// `v = momentum * v + lr * g; p -= v`
fn sgd_update(args: &mut KernelArgs<'_>) -> Result<(), String> {
    args.expect_regions(3)?;
    args.expect_same_len(0, 1)?;
    args.expect_same_len(0, 2)?;
    let (learning_rate, momentum) = (args.real(0)?, args.real(1)?);

    let mut parameter = std::mem::take(&mut args.regions[0]);
    let mut velocity = std::mem::take(&mut args.regions[2]);
    for k in 0..parameter.len() {
        velocity[k] = momentum * velocity[k] + learning_rate * args.regions[1][k];
        parameter[k] -= velocity[k];
    }
    args.regions[0] = parameter;
    args.regions[2] = velocity;
    Ok(())
}
