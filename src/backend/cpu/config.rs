//! Configuration for the CPU reference accelerator

use std::collections::HashSet;
use std::time::Duration;

use crate::backend::BackendError;

/// Configuration for [`super::CpuAccelerator`]
///
/// Besides the optional memory cap, everything here exists to exercise the
/// scheduler: completion jitter reorders completion signals, and the fault
/// injection sets make specific submissions or kernels fail.
#[derive(Debug, Clone, Default)]
pub struct CpuConfig {
    /// Upper bound of the random delay before a completion signal fires
    pub completion_jitter: Option<Duration>,

    /// Maximum number of live elements across all buffers
    pub memory_limit: Option<usize>,

    /// Zero-based submission ordinals that are rejected by `submit`
    pub failing_submissions: HashSet<usize>,

    /// Kernels whose execution reports failure through the completion signal
    pub failing_kernels: HashSet<String>,
}

impl CpuConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion_jitter(mut self, jitter: Duration) -> Self {
        self.completion_jitter = Some(jitter);
        self
    }

    pub fn with_memory_limit(mut self, elements: usize) -> Self {
        self.memory_limit = Some(elements);
        self
    }

    pub fn with_failing_submission(mut self, ordinal: usize) -> Self {
        self.failing_submissions.insert(ordinal);
        self
    }

    pub fn with_failing_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.failing_kernels.insert(kernel.into());
        self
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        if self.memory_limit == Some(0) {
            return Err(BackendError::InvalidConfig(
                "memory_limit must be greater than 0".to_string(),
            ));
        }
        if self.completion_jitter.map_or(false, |j| j > Duration::from_secs(1)) {
            return Err(BackendError::InvalidConfig(format!(
                "completion_jitter of {:?} exceeds one second",
                self.completion_jitter.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// True when any fault injection is configured
    pub fn injects_faults(&self) -> bool {
        !self.failing_submissions.is_empty() || !self.failing_kernels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_config_default() {
        let config = CpuConfig::default();
        assert!(config.completion_jitter.is_none());
        assert!(config.memory_limit.is_none());
        assert!(!config.injects_faults());
    }

    #[test]
    fn test_cpu_config_builder() {
        let config = CpuConfig::new()
            .with_completion_jitter(Duration::from_micros(250))
            .with_memory_limit(1 << 20)
            .with_failing_submission(3)
            .with_failing_kernel("sgd_update");

        assert_eq!(config.completion_jitter, Some(Duration::from_micros(250)));
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert!(config.failing_submissions.contains(&3));
        assert!(config.failing_kernels.contains("sgd_update"));
        assert!(config.injects_faults());
    }

    #[test]
    fn test_cpu_config_validate() {
        assert!(CpuConfig::default().validate().is_ok());
        assert!(CpuConfig::new().with_memory_limit(0).validate().is_err());
        assert!(CpuConfig::new()
            .with_completion_jitter(Duration::from_secs(5))
            .validate()
            .is_err());
    }
}
