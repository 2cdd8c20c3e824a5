//! Batch layout conversions
//!
//! Physical buffers are feature-major: element `i` of batch item `b` sits at
//! `i * batch + b`, so a node's logical range `[o, o + n)` is the contiguous
//! physical range `[o * batch, (o + n) * batch)`. Host data arrives and leaves
//! sample-major (each batch item's features contiguous).

/// Sample-major `batch x features` to feature-major `features x batch`.
pub fn to_feature_major(samples: &[f32], features: usize, batch: usize) -> Vec<f32> {
    let mut out = vec![0.0; features * batch];
    for b in 0..batch {
        for i in 0..features {
            if let Some(value) = samples.get(b * features + i) {
                out[i * batch + b] = *value;
            }
        }
    }
    out
}

/// Feature-major `features x batch` back to sample-major `batch x features`.
pub fn to_sample_major(interleaved: &[f32], features: usize, batch: usize) -> Vec<f32> {
    let mut out = vec![0.0; features * batch];
    for i in 0..features {
        for b in 0..batch {
            if let Some(value) = interleaved.get(i * batch + b) {
                out[b * features + i] = *value;
            }
        }
    }
    out
}
