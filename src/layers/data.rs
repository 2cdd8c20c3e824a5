//! Host data endpoints: sources feed a pass, sinks receive its results

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Capabilities, Layer, LayerError, LayerId};
use crate::error::ForgeResult;

/// Source that cycles through an in-memory list of samples.
///
/// `samples` is sample-major: `size` elements per sample, any number of
/// samples. Each batch takes the next `batch_size` samples, wrapping around.
#[derive(Debug)]
pub struct DataSource {
    id: LayerId,
    name: String,
    size: usize,
    samples: Vec<f32>,
    cursor: AtomicUsize,
}

impl DataSource {
    pub fn new(name: impl Into<String>, size: usize, samples: Vec<f32>) -> Self {
        DataSource {
            id: LayerId::next(),
            name: name.into(),
            size,
            samples,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn sample_count(&self) -> usize {
        if self.size == 0 {
            0
        } else {
            self.samples.len() / self.size
        }
    }
}

impl Layer for DataSource {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::source()
    }

    fn input_size(&self) -> usize {
        0
    }

    fn output_size(&self) -> usize {
        self.size
    }

    fn next_batch(&self, batch_size: usize) -> ForgeResult<Vec<f32>> {
        let count = self.sample_count();
        if count == 0 || self.samples.len() % self.size != 0 {
            return Err(LayerError::NoData {
                layer: self.name.clone(),
            }
            .into());
        }

        let start = self.cursor.fetch_add(batch_size, Ordering::SeqCst);
        let mut batch = Vec::with_capacity(batch_size * self.size);
        for b in 0..batch_size {
            let sample = (start + b) % count;
            batch.extend_from_slice(&self.samples[sample * self.size..(sample + 1) * self.size]);
        }
        Ok(batch)
    }
}

/// Sink that records every batch it receives.
#[derive(Debug)]
pub struct CollectSink {
    id: LayerId,
    name: String,
    size: usize,
    received: Mutex<Vec<Vec<f32>>>,
}

impl CollectSink {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        CollectSink {
            id: LayerId::next(),
            name: name.into(),
            size,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Most recent batch, sample-major
    pub fn last(&self) -> Option<Vec<f32>> {
        self.received
            .lock()
            .ok()
            .and_then(|received| received.last().cloned())
    }

    pub fn batches(&self) -> Vec<Vec<f32>> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }

    pub fn batch_count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Layer for CollectSink {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::sink()
    }

    fn input_size(&self) -> usize {
        self.size
    }

    fn output_size(&self) -> usize {
        0
    }

    fn consume(&self, batch: &[f32], _batch_size: usize) {
        match self.received.lock() {
            Ok(mut received) => received.push(batch.to_vec()),
            Err(e) => tracing::error!(sink = %self.name, "dropping batch: {}", e),
        }
    }
}
