// Declarative test scripts: (velocity targets, hold) steps
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::MotorError;

// Velocity used by the built-in bench scripts (rad/s)
const BENCH_VELOCITY: f32 = 3.0;
const RUN_MS: u64 = 3000;
const PAUSE_MS: u64 = 1000;

/// Velocity for one motor, addressed by its index in the configured motor list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityTarget {
    pub motor: usize,
    pub velocity: f32,
}

/// Commands sent together, then held for `hold_ms`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub label: String,
    pub targets: Vec<VelocityTarget>,
    #[serde(default)]
    pub hold_ms: u64,
}

impl Step {
    /// Same velocity on every motor in `motors`
    pub fn uniform(label: &str, motors: usize, velocity: f32, hold_ms: u64) -> Self {
        Self::per_motor(label, &vec![velocity; motors], hold_ms)
    }

    /// One velocity per motor, by index
    pub fn per_motor(label: &str, velocities: &[f32], hold_ms: u64) -> Self {
        Self {
            label: label.to_string(),
            targets: velocities
                .iter()
                .enumerate()
                .map(|(motor, &velocity)| VelocityTarget { motor, velocity })
                .collect(),
            hold_ms,
        }
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    /// Forward, stop, backward, stop on a single motor
    pub fn single_motor() -> Self {
        Self {
            steps: vec![
                Step::uniform("Motor forward", 1, BENCH_VELOCITY, RUN_MS),
                Step::uniform("Motor stopped", 1, 0.0, PAUSE_MS),
                Step::uniform("Motor backward", 1, -BENCH_VELOCITY, RUN_MS),
                Step::uniform("Motor stopped", 1, 0.0, PAUSE_MS),
            ],
        }
    }

    /// Both directions together, then opposite directions, on two motors
    pub fn dual_motor() -> Self {
        Self {
            steps: vec![
                Step::uniform("Both motors forward", 2, BENCH_VELOCITY, RUN_MS),
                Step::uniform("Both motors stopped", 2, 0.0, PAUSE_MS),
                Step::uniform("Both motors backward", 2, -BENCH_VELOCITY, RUN_MS),
                Step::uniform("Both motors stopped", 2, 0.0, PAUSE_MS),
                Step::per_motor(
                    "Motor 1 forward, motor 2 backward",
                    &[BENCH_VELOCITY, -BENCH_VELOCITY],
                    RUN_MS,
                ),
                Step::uniform("Both motors stopped", 2, 0.0, PAUSE_MS),
            ],
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, MotorError> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| MotorError::Config(e.to_string()))
    }

    /// Highest motor index referenced by any step
    pub fn max_motor_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .flat_map(|step| step.targets.iter().map(|t| t.motor))
            .max()
    }
}
