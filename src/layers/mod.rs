//! Layers: the opaque units of computation wrapped by graph nodes
//!
//! A layer declares its [`Capabilities`] and element counts, and describes its
//! work as [`Invocation`]s built through an [`InvocationBuilder`] when a runner
//! is constructed. The scheduler never looks inside a layer beyond that.

pub mod activation;
pub mod data;
pub mod inner_product;
pub mod invocation;
pub mod kernels;
pub mod loss;
pub mod transpose;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::error::ForgeResult;

pub use activation::{ReluLayer, SigmoidLayer};
pub use data::{CollectSink, DataSource};
pub use inner_product::InnerProductLayer;
pub use invocation::{
    BindingSource, BufferBinding, Invocation, InvocationBuilder, LayerProgram, ParameterHandle,
    ParameterId, ParameterSpec,
};
pub use loss::L2LossLayer;
pub use transpose::TransposeLayer;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique layer identity; graph insertion is idempotent on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    pub fn next() -> Self {
        LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// What a layer declares it can do. Validated into a
/// [`NodeKind`](crate::graph::NodeKind) when the layer is added to a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub source: bool,
    pub transform: bool,
    pub sink: bool,
    pub loss: bool,
    pub trainable: bool,
}

impl Capabilities {
    pub const fn source() -> Self {
        Capabilities {
            source: true,
            transform: false,
            sink: false,
            loss: false,
            trainable: false,
        }
    }

    pub const fn sink() -> Self {
        Capabilities {
            source: false,
            transform: false,
            sink: true,
            loss: false,
            trainable: false,
        }
    }

    pub const fn transform() -> Self {
        Capabilities {
            source: false,
            transform: true,
            sink: false,
            loss: false,
            trainable: false,
        }
    }

    pub const fn with_loss(mut self) -> Self {
        self.loss = true;
        self
    }

    pub const fn with_trainable(mut self) -> Self {
        self.trainable = true;
        self
    }
}

/// Errors raised by layer definitions
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    #[error("layer '{layer}' does not support {operation}")]
    Unsupported {
        layer: String,
        operation: &'static str,
    },

    #[error("layer '{layer}' has invalid parameters: {reason}")]
    InvalidParameters { layer: String, reason: String },

    #[error("layer '{layer}' has no data")]
    NoData { layer: String },
}

/// A unit of computation wrapped by exactly one graph node.
///
/// Sizes are per batch item. Sources implement [`Layer::next_batch`], sinks
/// implement [`Layer::consume`], transforms implement [`Layer::initialize`].
pub trait Layer: Send + Sync + fmt::Debug {
    fn id(&self) -> LayerId;

    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Elements read per batch item; 0 for sources
    fn input_size(&self) -> usize;

    /// Elements written per batch item; 0 for sinks
    fn output_size(&self) -> usize;

    /// Describe the layer's forward and backward work for one node.
    ///
    /// Called once per runner. Parameters registered here are allocated once
    /// and shared by every execution instance.
    fn initialize(&self, _builder: &mut InvocationBuilder<'_>) -> ForgeResult<LayerProgram> {
        Ok(LayerProgram::default())
    }

    /// Next `batch_size` samples, sample-major, `output_size() * batch_size` elements.
    fn next_batch(&self, _batch_size: usize) -> ForgeResult<Vec<f32>> {
        Err(LayerError::Unsupported {
            layer: self.name().to_string(),
            operation: "next_batch",
        }
        .into())
    }

    /// Receive one pass's input, sample-major, `input_size() * batch_size` elements.
    fn consume(&self, _batch: &[f32], _batch_size: usize) {}
}

/// Shared handle to a layer
pub type LayerRef = Arc<dyn Layer>;
