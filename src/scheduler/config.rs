//! Runner configuration

use serde::{Deserialize, Serialize};

use super::types::SchedulerError;

/// Configuration for [`super::Runner`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Number of execution slots, which is also the in-flight pass bound K
    pub instance_count: usize,

    /// Batch items per pass
    pub batch_size: usize,

    /// Allocate backward instances, gradients and velocities
    pub training: bool,

    /// Prefix for device buffer labels and log fields
    pub label: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            instance_count: 3,
            batch_size: 1,
            training: false,
            label: "runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_count(mut self, instance_count: usize) -> Self {
        self.instance_count = instance_count;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.instance_count == 0 {
            return Err(SchedulerError::InvalidConfig(
                "instance_count must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size > u32::MAX as usize {
            return Err(SchedulerError::InvalidConfig(format!(
                "batch_size {} does not fit a kernel scalar",
                self.batch_size
            )));
        }
        Ok(())
    }
}
