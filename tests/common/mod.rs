//! Shared fixtures for the integration tests
//!
//! Every fixture builds its graph on a fresh [`CpuAccelerator`], so tests can
//! run in parallel. Tests that inspect the accelerator's execution log or
//! depend on timing are marked `#[serial]`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use graphforge::backend::{CpuAccelerator, CpuConfig};
use graphforge::graph::{Graph, GraphBuilder, NodeId};
use graphforge::layers::{CollectSink, DataSource, InnerProductLayer, L2LossLayer, ReluLayer};
use graphforge::scheduler::{Runner, RunnerConfig};

pub use serial_test::serial;

pub fn cpu() -> Arc<CpuAccelerator> {
    CpuAccelerator::shared_default().expect("CPU accelerator")
}

pub fn jittery_cpu(max: Duration) -> Arc<CpuAccelerator> {
    Arc::new(
        CpuAccelerator::new(CpuConfig::default().with_completion_jitter(max))
            .expect("CPU accelerator"),
    )
}

/// Set `GRAPHFORGE_LOG_LEVEL=debug` to see scheduler events while a test runs.
pub fn runner(graph: Graph, accelerator: Arc<CpuAccelerator>, config: RunnerConfig) -> Runner {
    graphforge::logging::init_logging_default();
    Runner::new(graph, accelerator, config).expect("runner")
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {:?} vs {:?}",
        actual,
        expected
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {} differs: {} vs {} (actual {:?}, expected {:?})",
            i,
            a,
            e,
            actual,
            expected
        );
    }
}

/// source(2) -> inner product 2->1 -> sink(1), weights [2, 4], bias [1]
pub struct SingleDense {
    pub graph: Graph,
    pub source: NodeId,
    pub dense: NodeId,
    pub sink: NodeId,
    pub output: Arc<CollectSink>,
}

pub fn single_dense(samples: Vec<f32>, weights: Vec<f32>, biases: Vec<f32>) -> SingleDense {
    let source = Arc::new(DataSource::new("x", 2, samples));
    let dense = Arc::new(InnerProductLayer::new("dense", 2, 1, weights, biases).expect("dense layer"));
    let output = Arc::new(CollectSink::new("out", 1));

    let mut builder = GraphBuilder::new();
    let source_id = builder.add(&source).expect("add source");
    let dense_id = builder.add(&dense).expect("add dense");
    let sink_id = builder.add(&output).expect("add sink");
    builder.chain(&[source_id, dense_id, sink_id]).expect("chain");

    SingleDense {
        graph: builder.finish(),
        source: source_id,
        dense: dense_id,
        sink: sink_id,
        output,
    }
}

/// x(2) -> ip1 2->2 -> relu -> ip2 2->2 -> L2 loss (with labels) -> sink
pub struct TwoLayerNet {
    pub graph: Graph,
    pub ip1: NodeId,
    pub relu: NodeId,
    pub ip2: NodeId,
    pub loss: NodeId,
    pub sink: NodeId,
    pub loss_output: Arc<CollectSink>,
}

/// The hand-checked network used by the golden training tests.
pub fn two_layer_net() -> TwoLayerNet {
    two_layer_net_with(
        vec![1.0, 2.0],
        vec![1.0, 0.0],
        InnerProductLayer::new("ip1", 2, 2, vec![0.5, -1.0, 0.25, 0.5], vec![0.1, 0.2])
            .expect("ip1"),
        InnerProductLayer::new("ip2", 2, 2, vec![1.0, 0.5, -1.0, 2.0], vec![0.0, 0.1])
            .expect("ip2"),
    )
}

pub fn two_layer_net_with(
    inputs: Vec<f32>,
    labels: Vec<f32>,
    ip1: InnerProductLayer,
    ip2: InnerProductLayer,
) -> TwoLayerNet {
    let x = Arc::new(DataSource::new("x", 2, inputs));
    let y = Arc::new(DataSource::new("labels", 2, labels));
    let ip1 = Arc::new(ip1);
    let relu = Arc::new(ReluLayer::new("relu", 2));
    let ip2 = Arc::new(ip2);
    let loss = Arc::new(L2LossLayer::new("loss", 2));
    let loss_output = Arc::new(CollectSink::new("loss_out", 1));

    let mut builder = GraphBuilder::new();
    let x_id = builder.add(&x).expect("x");
    let y_id = builder.add(&y).expect("labels");
    let ip1_id = builder.add(&ip1).expect("ip1");
    let relu_id = builder.add(&relu).expect("relu");
    let ip2_id = builder.add(&ip2).expect("ip2");
    let loss_id = builder.add(&loss).expect("loss");
    let sink_id = builder.add(&loss_output).expect("sink");

    builder.chain(&[x_id, ip1_id, relu_id, ip2_id]).expect("chain");
    builder.join(&[ip2_id, y_id], loss_id).expect("join");
    builder.link(loss_id, sink_id).expect("link");

    TwoLayerNet {
        graph: builder.finish(),
        ip1: ip1_id,
        relu: relu_id,
        ip2: ip2_id,
        loss: loss_id,
        sink: sink_id,
        loss_output,
    }
}

/// Regression problem a 2->1 inner product can fit exactly: y = 2a - b + 0.5
pub fn linear_regression() -> Graph {
    let inputs = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.5, -0.5];
    let labels = inputs
        .chunks(2)
        .map(|s| 2.0 * s[0] - s[1] + 0.5)
        .collect::<Vec<_>>();

    let x = Arc::new(DataSource::new("x", 2, inputs));
    let y = Arc::new(DataSource::new("y", 1, labels));
    let dense = Arc::new(InnerProductLayer::zeros("dense", 2, 1));
    let loss = Arc::new(L2LossLayer::new("loss", 1));
    let sink = Arc::new(CollectSink::new("loss_out", 1));

    let mut builder = GraphBuilder::new();
    let x_id = builder.add(&x).expect("x");
    let y_id = builder.add(&y).expect("y");
    let dense_id = builder.add(&dense).expect("dense");
    let loss_id = builder.add(&loss).expect("loss");
    let sink_id = builder.add(&sink).expect("sink");
    builder.link(x_id, dense_id).expect("link");
    builder.join(&[dense_id, y_id], loss_id).expect("join");
    builder.link(loss_id, sink_id).expect("link");
    builder.finish()
}
