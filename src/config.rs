// Serial link, motor and safety configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::{MotorError, MotorType};

// Serial port for the USB-CAN adapter
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

// Bound on every blocking read from the adapter
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

// Velocity limit applied to every command (rad/s)
pub const MAX_SPEED: f32 = 6.0;

// Wait after enabling before the first set-point
pub const ENABLE_SETTLE: Duration = Duration::from_millis(200);

// Default motor: DM6006 on command id 0x01, feedback id 0x11
pub const DEFAULT_MOTOR_TYPE: MotorType = MotorType::Dm6006;
pub const DEFAULT_COMMAND_ID: u16 = 0x01;
pub const DEFAULT_FEEDBACK_ID: u16 = 0x11;

/// One motor on the bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSpec {
    pub command_id: u16,
    pub feedback_id: u16,
    #[serde(default = "default_motor_type")]
    pub motor_type: MotorType,
}

fn default_motor_type() -> MotorType {
    DEFAULT_MOTOR_TYPE
}

/// Session settings, every field optional in the JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub max_speed: f32,
    pub motors: Vec<MotorSpec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            max_speed: MAX_SPEED,
            motors: vec![MotorSpec {
                command_id: DEFAULT_COMMAND_ID,
                feedback_id: DEFAULT_FEEDBACK_ID,
                motor_type: DEFAULT_MOTOR_TYPE,
            }],
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Two DM6006 motors on 0x01/0x11 and 0x02/0x12
    pub fn dual_motor() -> Self {
        Self {
            motors: vec![
                MotorSpec {
                    command_id: 0x01,
                    feedback_id: 0x11,
                    motor_type: DEFAULT_MOTOR_TYPE,
                },
                MotorSpec {
                    command_id: 0x02,
                    feedback_id: 0x12,
                    motor_type: DEFAULT_MOTOR_TYPE,
                },
            ],
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, MotorError> {
        let config: Self = serde_json::from_str(json).map_err(|e| MotorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, MotorError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), MotorError> {
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(MotorError::Config(format!("max_speed must be positive, got {}", self.max_speed)));
        }
        if self.read_timeout_ms == 0 {
            return Err(MotorError::Config("read_timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_bench_setup() {
        let config = SessionConfig::default();
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_speed, 6.0);
        assert_eq!(config.motors.len(), 1);
        assert_eq!(config.motors[0].command_id, 0x01);
        assert_eq!(config.motors[0].feedback_id, 0x11);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{
                "port": "COM13",
                "motors": [
                    {"command_id": 1, "feedback_id": 17},
                    {"command_id": 2, "feedback_id": 18, "motor_type": "DM4310"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.port, "COM13");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.motors[0].motor_type, MotorType::Dm6006);
        assert_eq!(config.motors[1].motor_type, MotorType::Dm4310);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"max_speed": -1.0}"#),
            Err(MotorError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_json_str(r#"{"read_timeout_ms": 0}"#),
            Err(MotorError::Config(_))
        ));
        assert!(matches!(SessionConfig::from_json_str("not json"), Err(MotorError::Config(_))));
    }
}
