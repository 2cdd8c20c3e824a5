//! Kernel names used by the reference layers.
//!
//! Any accelerator that wants to run the reference layers registers kernels
//! under these names. Argument order is documented next to each constant.

/// `[input, weights, biases, output]`, scalars `[batch, inputs, outputs]`
pub const INNER_PRODUCT_FORWARD: &str = "inner_product_forward";
/// `[output_deltas, input, weights, input_deltas+, weight_grad+, bias_grad+]`,
/// scalars `[batch, inputs, outputs]`
pub const INNER_PRODUCT_BACKWARD: &str = "inner_product_backward";

/// `[input, output]`, scalars `[negative_slope]`
pub const RELU_FORWARD: &str = "relu_forward";
/// `[output_deltas, input, input_deltas+]`, scalars `[negative_slope]`
pub const RELU_BACKWARD: &str = "relu_backward";

/// `[input, output]`
pub const SIGMOID_FORWARD: &str = "sigmoid_forward";
/// `[output_deltas, input, input_deltas+]`
pub const SIGMOID_BACKWARD: &str = "sigmoid_backward";

/// `[input (predictions ++ labels), output]`, scalars `[batch, size]`
pub const L2_LOSS_FORWARD: &str = "l2_loss_forward";
/// `[input, input_deltas+]`, scalars `[batch, size]`
pub const L2_LOSS_BACKWARD: &str = "l2_loss_backward";

/// `[input (sample-major), output (feature-major)]`, scalars `[batch, size]`
pub const TRANSPOSE: &str = "transpose";

/// `[parameter+, gradient, velocity+]`, scalars `[learning_rate, momentum]`
pub const SGD_UPDATE: &str = "sgd_update";

/// Every kernel the reference layers and the solver may ask for
pub const ALL: &[&str] = &[
    INNER_PRODUCT_FORWARD,
    INNER_PRODUCT_BACKWARD,
    RELU_FORWARD,
    RELU_BACKWARD,
    SIGMOID_FORWARD,
    SIGMOID_BACKWARD,
    L2_LOSS_FORWARD,
    L2_LOSS_BACKWARD,
    TRANSPOSE,
    SGD_UPDATE,
];
