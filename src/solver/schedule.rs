//! Learning-rate schedules

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Settings for one SGD update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdParameters {
    pub learning_rate: f32,
    pub momentum: f32,
}

impl SgdParameters {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        SgdParameters {
            learning_rate,
            momentum,
        }
    }
}

impl Default for SgdParameters {
    fn default() -> Self {
        SgdParameters {
            learning_rate: 0.001,
            momentum: 0.1,
        }
    }
}

/// Maps a 1-based step index to the update settings for that step.
///
/// Decaying schedules scale the learning rate only; momentum stays at the
/// base value.
#[derive(Clone)]
pub enum LearningRateSchedule {
    Constant(SgdParameters),
    /// Multiply the learning rate by `gamma` every `step_size` steps
    StepDecay {
        base: SgdParameters,
        gamma: f32,
        step_size: usize,
    },
    /// Multiply the learning rate by `gamma` every step
    Exponential { base: SgdParameters, gamma: f32 },
    Custom(Arc<dyn Fn(usize) -> SgdParameters + Send + Sync>),
}

impl LearningRateSchedule {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) -> SgdParameters + Send + Sync + 'static,
    {
        LearningRateSchedule::Custom(Arc::new(f))
    }

    /// Settings for `step`; step 1 always uses the base learning rate.
    pub fn parameters_at(&self, step: usize) -> SgdParameters {
        let elapsed = step.saturating_sub(1);
        match self {
            LearningRateSchedule::Constant(params) => *params,
            LearningRateSchedule::StepDecay {
                base,
                gamma,
                step_size,
            } => {
                let decays = elapsed / (*step_size).max(1);
                SgdParameters {
                    learning_rate: base.learning_rate * gamma.powi(decays as i32),
                    momentum: base.momentum,
                }
            }
            LearningRateSchedule::Exponential { base, gamma } => SgdParameters {
                learning_rate: base.learning_rate * gamma.powi(elapsed as i32),
                momentum: base.momentum,
            },
            LearningRateSchedule::Custom(f) => f(step),
        }
    }
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        LearningRateSchedule::Constant(SgdParameters::default())
    }
}

impl fmt::Debug for LearningRateSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearningRateSchedule::Constant(params) => f.debug_tuple("Constant").field(params).finish(),
            LearningRateSchedule::StepDecay {
                base,
                gamma,
                step_size,
            } => f
                .debug_struct("StepDecay")
                .field("base", base)
                .field("gamma", gamma)
                .field("step_size", step_size)
                .finish(),
            LearningRateSchedule::Exponential { base, gamma } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("gamma", gamma)
                .finish(),
            LearningRateSchedule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_constant_schedule() {
        let params = SgdParameters::new(0.1, 0.5);
        let schedule = LearningRateSchedule::Constant(params);
        assert_eq!(schedule.parameters_at(1), params);
        assert_eq!(schedule.parameters_at(100), params);
    }

    #[test]
    fn test_step_decay() {
        let schedule = LearningRateSchedule::StepDecay {
            base: SgdParameters::new(0.1, 0.9),
            gamma: 0.5,
            step_size: 3,
        };
        assert!(approx_eq(schedule.parameters_at(1).learning_rate, 0.1));
        assert!(approx_eq(schedule.parameters_at(3).learning_rate, 0.1));
        assert!(approx_eq(schedule.parameters_at(4).learning_rate, 0.05));
        assert!(approx_eq(schedule.parameters_at(7).learning_rate, 0.025));
        assert!(approx_eq(schedule.parameters_at(7).momentum, 0.9));
    }

    #[test]
    fn test_exponential_decay() {
        let schedule = LearningRateSchedule::Exponential {
            base: SgdParameters::new(1.0, 0.0),
            gamma: 0.9,
        };
        assert!(approx_eq(schedule.parameters_at(1).learning_rate, 1.0));
        assert!(approx_eq(schedule.parameters_at(2).learning_rate, 0.9));
        assert!(approx_eq(schedule.parameters_at(3).learning_rate, 0.81));
    }

    #[test]
    fn test_custom_schedule_sees_step() {
        let schedule = LearningRateSchedule::custom(|step| SgdParameters::new(step as f32, 0.0));
        assert_eq!(schedule.parameters_at(4).learning_rate, 4.0);
        assert_eq!(format!("{:?}", schedule), "Custom(..)");
    }

    #[test]
    fn test_default_parameters() {
        let params = SgdParameters::default();
        assert!(approx_eq(params.learning_rate, 0.001));
        assert!(approx_eq(params.momentum, 0.1));
    }
}
