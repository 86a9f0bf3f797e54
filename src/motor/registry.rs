// Motor registry: hardware variants, per-motor state and the enable/mode state machine

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::damiao::{ControlCommand, FeedbackFrame};
use super::error::{MotorError, Result};

/// Highest command/feedback address accepted on the bus.
/// Larger ids would overlap the mode bases (0x100, 0x200) of other motors.
pub const MAX_ADDRESS: u16 = 0xFF;

/// DaMiao actuator models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorType {
    #[serde(rename = "DM4310")]
    Dm4310,
    #[serde(rename = "DM4310_48V")]
    Dm4310V48,
    #[serde(rename = "DM4340")]
    Dm4340,
    #[serde(rename = "DM4340_48V")]
    Dm4340V48,
    #[serde(rename = "DM6006")]
    Dm6006,
    #[serde(rename = "DM8006")]
    Dm8006,
    #[serde(rename = "DM8009")]
    Dm8009,
    #[serde(rename = "DM10010L")]
    Dm10010L,
    #[serde(rename = "DM10010")]
    Dm10010,
}

/// Symmetric ranges used to scale fixed-point fields on the bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Position range, rad
    pub p_max: f32,
    /// Velocity range, rad/s
    pub v_max: f32,
    /// Torque range, N·m
    pub t_max: f32,
}

impl MotorType {
    pub fn limits(self) -> Limits {
        let (p_max, v_max, t_max) = match self {
            MotorType::Dm4310 => (12.5, 30.0, 10.0),
            MotorType::Dm4310V48 => (12.5, 50.0, 10.0),
            MotorType::Dm4340 => (12.5, 8.0, 28.0),
            MotorType::Dm4340V48 => (12.5, 10.0, 28.0),
            MotorType::Dm6006 => (12.5, 45.0, 20.0),
            MotorType::Dm8006 => (12.5, 45.0, 40.0),
            MotorType::Dm8009 => (12.5, 45.0, 54.0),
            MotorType::Dm10010L => (12.5, 25.0, 200.0),
            MotorType::Dm10010 => (12.5, 20.0, 200.0),
        };
        Limits {
            p_max,
            v_max,
            t_max,
        }
    }
}

/// Control-loop target the actuator is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Velocity,
    Position,
    Torque,
}

impl ControlMode {
    /// Value written to the control-mode register
    pub fn register_value(self) -> u32 {
        match self {
            ControlMode::Torque => 1,
            ControlMode::Position => 2,
            ControlMode::Velocity => 3,
        }
    }

    pub fn from_register_value(value: u32) -> Option<Self> {
        match value {
            1 => Some(ControlMode::Torque),
            2 => Some(ControlMode::Position),
            3 => Some(ControlMode::Velocity),
            _ => None,
        }
    }

    /// Offset added to the command address to form the CAN id
    pub fn can_base(self) -> u16 {
        match self {
            ControlMode::Torque => 0x000,
            ControlMode::Position => 0x100,
            ControlMode::Velocity => 0x200,
        }
    }
}

/// Lightweight reference to a registered motor, keyed by its command address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotorHandle(u16);

impl MotorHandle {
    pub fn address(self) -> u16 {
        self.0
    }
}

/// One physical actuator on the bus
#[derive(Debug, Clone)]
pub struct Motor {
    motor_type: MotorType,
    command_address: u16,
    feedback_address: u16,
    speed_limit: f32,
    enabled: bool,
    mode: Option<ControlMode>,
    pub(crate) last_feedback: Option<FeedbackFrame>,
    pub(crate) last_command: Option<ControlCommand>,
    /// Register whose write acknowledgement is still outstanding
    pub(crate) awaiting_ack: Option<u8>,
}

impl Motor {
    /// `max_speed` is further bounded by the model's velocity range.
    /// A non-finite or non-positive `max_speed` leaves a limit of zero.
    pub fn new(motor_type: MotorType, command_address: u16, feedback_address: u16, max_speed: f32) -> Self {
        let speed_limit = if max_speed.is_finite() && max_speed > 0.0 {
            max_speed.min(motor_type.limits().v_max)
        } else {
            0.0
        };
        Self {
            motor_type,
            command_address,
            feedback_address,
            speed_limit,
            enabled: false,
            mode: None,
            last_feedback: None,
            last_command: None,
            awaiting_ack: None,
        }
    }

    pub fn motor_type(&self) -> MotorType {
        self.motor_type
    }

    pub fn command_address(&self) -> u16 {
        self.command_address
    }

    pub fn feedback_address(&self) -> u16 {
        self.feedback_address
    }

    pub fn speed_limit(&self) -> f32 {
        self.speed_limit
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> Option<ControlMode> {
        self.mode
    }

    pub fn last_feedback(&self) -> Option<&FeedbackFrame> {
        self.last_feedback.as_ref()
    }

    pub fn last_command(&self) -> Option<&ControlCommand> {
        self.last_command.as_ref()
    }

    /// Largest magnitude accepted for a command in `mode`
    pub fn limit_for(&self, mode: ControlMode) -> f32 {
        let limits = self.motor_type.limits();
        match mode {
            ControlMode::Velocity => self.speed_limit,
            ControlMode::Position => limits.p_max,
            ControlMode::Torque => limits.t_max,
        }
    }
}

/// Registered motors, in registration order
#[derive(Debug, Default)]
pub struct MotorRegistry {
    motors: Vec<Motor>,
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, motor: Motor) -> Result<MotorHandle> {
        for address in [motor.command_address, motor.feedback_address] {
            if address == 0 || address > MAX_ADDRESS {
                return Err(MotorError::InvalidAddress { address });
            }
        }
        if motor.command_address == motor.feedback_address {
            return Err(MotorError::DuplicateAddress {
                address: motor.feedback_address,
            });
        }

        // Command and feedback ids share one address space on the bus
        for existing in &self.motors {
            for address in [motor.command_address, motor.feedback_address] {
                if address == existing.command_address || address == existing.feedback_address {
                    return Err(MotorError::DuplicateAddress { address });
                }
            }
        }

        debug!(
            "Registered {:?} command=0x{:02X} feedback=0x{:02X}",
            motor.motor_type, motor.command_address, motor.feedback_address
        );
        let handle = MotorHandle(motor.command_address);
        self.motors.push(motor);
        Ok(handle)
    }

    pub fn get(&self, handle: MotorHandle) -> Result<&Motor> {
        self.motors
            .iter()
            .find(|m| m.command_address == handle.0)
            .ok_or(MotorError::NotRegistered { address: handle.0 })
    }

    pub fn get_mut(&mut self, handle: MotorHandle) -> Result<&mut Motor> {
        self.motors
            .iter_mut()
            .find(|m| m.command_address == handle.0)
            .ok_or(MotorError::NotRegistered { address: handle.0 })
    }

    pub fn by_feedback_address_mut(&mut self, address: u16) -> Option<&mut Motor> {
        self.motors.iter_mut().find(|m| m.feedback_address == address)
    }

    pub fn by_command_address_mut(&mut self, address: u16) -> Option<&mut Motor> {
        self.motors.iter_mut().find(|m| m.command_address == address)
    }

    /// Disabled -> Enabled(mode = None). Re-enabling keeps the current mode.
    pub fn mark_enabled(&mut self, handle: MotorHandle) -> Result<()> {
        let motor = self.get_mut(handle)?;
        if !motor.enabled {
            motor.enabled = true;
            motor.mode = None;
        }
        Ok(())
    }

    /// Enabled(_) -> Enabled(mode)
    pub fn set_mode(&mut self, handle: MotorHandle, mode: ControlMode) -> Result<()> {
        let motor = self.get_mut(handle)?;
        if !motor.enabled {
            return Err(MotorError::NotEnabled {
                address: motor.command_address,
            });
        }
        motor.mode = Some(mode);
        Ok(())
    }

    /// Any state -> Disabled
    pub fn mark_disabled(&mut self, handle: MotorHandle) -> Result<()> {
        let motor = self.get_mut(handle)?;
        motor.enabled = false;
        motor.mode = None;
        motor.awaiting_ack = None;
        Ok(())
    }

    pub fn handles(&self) -> Vec<MotorHandle> {
        self.motors.iter().map(|m| MotorHandle(m.command_address)).collect()
    }

    pub fn enabled_handles(&self) -> Vec<MotorHandle> {
        self.motors
            .iter()
            .filter(|m| m.enabled)
            .map(|m| MotorHandle(m.command_address))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Motor> {
        self.motors.iter()
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }
}
