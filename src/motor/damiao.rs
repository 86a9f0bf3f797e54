// DaMiao actuator protocol over a USB serial-to-CAN adapter
//
// TX: 30-byte adapter request wrapping one classic CAN frame:
//   [55 AA 1E 03 01 00 00 00 0A 00 00 00 00, CAN id (u32 LE), 00 08 00 00, data x8, 00]
// RX: 16-byte adapter report per received CAN frame:
//   [AA, cmd, 00, CAN id (u32 LE), data x8, 55]

use std::time::Instant;

use tracing::debug;

use super::error::{MotorError, Result};
use super::registry::{ControlMode, Motor, MotorType};

pub const TX_FRAME_LEN: usize = 30;
pub const RX_FRAME_LEN: usize = 16;

/// Adapter request template, CAN id and data are patched in
const TX_TEMPLATE: [u8; TX_FRAME_LEN] = [
    0x55, 0xAA, 0x1E, 0x03, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
const TX_CAN_ID: usize = 13;
const TX_DATA: usize = 21;

const RX_HEAD: u8 = 0xAA;
const RX_TAIL: u8 = 0x55;
const RX_CAN_ID: usize = 3;
const RX_DATA: usize = 7;
/// Adapter report code for "CAN frame received"
const RX_CMD_RECEIVED: u8 = 0x11;

/// Highest standard (11-bit) CAN id
const MAX_STD_CAN_ID: u32 = 0x7FF;

/// Parameter (register) access goes through a fixed CAN id
const PARAM_CAN_ID: u16 = 0x7FF;
const PARAM_READ: u8 = 0x33;
const PARAM_WRITE: u8 = 0x55;
pub const REG_CONTROL_MODE: u8 = 10;

// Fixed-point widths for MIT packing and feedback
const POSITION_BITS: u32 = 16;
const VELOCITY_BITS: u32 = 12;
const TORQUE_BITS: u32 = 12;
const GAIN_BITS: u32 = 12;
const KP_MAX: f32 = 500.0;
const KD_MAX: f32 = 5.0;

/// Commands carried as `FF FF FF FF FF FF FF xx` on the motor's own id
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCommand {
    ClearError = 0xFB,
    Enable = 0xFC,
    Disable = 0xFD,
    SetZero = 0xFE,
}

impl SpecialCommand {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xFB => Some(SpecialCommand::ClearError),
            0xFC => Some(SpecialCommand::Enable),
            0xFD => Some(SpecialCommand::Disable),
            0xFE => Some(SpecialCommand::SetZero),
            _ => None,
        }
    }
}

/// A control set-point accepted by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    pub address: u16,
    pub mode: ControlMode,
    pub value: f32,
    pub issued_at: Instant,
}

/// A TX frame read back into its meaning
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedCommand {
    Control {
        address: u16,
        mode: ControlMode,
        value: f32,
    },
    Special {
        address: u16,
        command: SpecialCommand,
    },
    SetMode {
        address: u16,
        mode: ControlMode,
    },
}

/// One CAN frame reported by the adapter, before scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub can_id: u16,
    pub data: [u8; 8],
}

/// Acknowledgement of a register read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAck {
    pub register: u8,
    pub value: u32,
}

/// Motor telemetry in physical units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackFrame {
    /// CAN id the frame arrived on (the motor's feedback address, or 0)
    pub source_address: u16,
    /// Command address reported inside the payload
    pub motor_address: u16,
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    /// Estimated output torque, N·m
    pub torque: f32,
    /// Upper nibble of the status byte, 0 when healthy
    pub fault_flags: u8,
    /// °C
    pub mos_temperature: u8,
    /// °C
    pub rotor_temperature: u8,
    pub received_at: Instant,
}

impl FeedbackFrame {
    pub fn has_fault(&self) -> bool {
        self.fault_flags != 0
    }
}

fn float_to_uint(x: f32, min: f32, max: f32, bits: u32) -> u16 {
    let span = max - min;
    let x = x.clamp(min, max);
    ((x - min) * ((1u32 << bits) - 1) as f32 / span) as u16
}

fn uint_to_float(x: u16, min: f32, max: f32, bits: u32) -> f32 {
    let span = max - min;
    x as f32 / ((1u32 << bits) - 1) as f32 * span + min
}

/// Wrap one CAN frame into an adapter request
fn build_frame(can_id: u16, data: [u8; 8]) -> [u8; TX_FRAME_LEN] {
    let mut frame = TX_TEMPLATE;
    frame[TX_CAN_ID..TX_CAN_ID + 4].copy_from_slice(&u32::from(can_id).to_le_bytes());
    frame[TX_DATA..TX_DATA + 8].copy_from_slice(&data);
    frame
}

fn check_range(mode: ControlMode, value: f32, limit: f32) -> Result<()> {
    if !value.is_finite() || value.abs() > limit {
        return Err(MotorError::Range { mode, value, limit });
    }
    Ok(())
}

/// Encode a set-point for `motor` in `mode`.
///
/// Values outside the motor's limit for that mode are rejected, never clamped.
pub fn encode_command(motor: &Motor, mode: ControlMode, value: f32) -> Result<[u8; TX_FRAME_LEN]> {
    check_range(mode, value, motor.limit_for(mode))?;

    let can_id = mode.can_base() + motor.command_address();
    let mut data = [0u8; 8];
    match mode {
        ControlMode::Velocity => {
            data[..4].copy_from_slice(&value.to_le_bytes());
        }
        ControlMode::Position => {
            // Position-velocity mode: target position plus travel speed
            data[..4].copy_from_slice(&value.to_le_bytes());
            data[4..].copy_from_slice(&motor.speed_limit().to_le_bytes());
        }
        ControlMode::Torque => {
            // MIT packing with zero gains leaves only the feed-forward torque
            let limits = motor.motor_type().limits();
            let q = float_to_uint(0.0, -limits.p_max, limits.p_max, POSITION_BITS);
            let dq = float_to_uint(0.0, -limits.v_max, limits.v_max, VELOCITY_BITS);
            let kp = float_to_uint(0.0, 0.0, KP_MAX, GAIN_BITS);
            let kd = float_to_uint(0.0, 0.0, KD_MAX, GAIN_BITS);
            let tau = float_to_uint(value, -limits.t_max, limits.t_max, TORQUE_BITS);
            data = [
                (q >> 8) as u8,
                (q & 0xFF) as u8,
                (dq >> 4) as u8,
                (((dq & 0xF) << 4) | ((kp >> 8) & 0xF)) as u8,
                (kp & 0xFF) as u8,
                (kd >> 4) as u8,
                (((kd & 0xF) << 4) | ((tau >> 8) & 0xF)) as u8,
                (tau & 0xFF) as u8,
            ];
        }
    }

    debug!(
        "Encode {:?} for motor 0x{:02X}: can_id=0x{:03X}, value={}",
        mode,
        motor.command_address(),
        can_id,
        value
    );
    Ok(build_frame(can_id, data))
}

/// Enable, disable, zero or clear-error frame for a motor
pub fn encode_special(address: u16, command: SpecialCommand) -> [u8; TX_FRAME_LEN] {
    let mut data = [0xFF; 8];
    data[7] = command as u8;
    build_frame(address, data)
}

/// Write the control-mode register of a motor
pub fn encode_set_mode(address: u16, mode: ControlMode) -> [u8; TX_FRAME_LEN] {
    let [lo, hi] = address.to_le_bytes();
    let [v0, v1, v2, v3] = mode.register_value().to_le_bytes();
    build_frame(PARAM_CAN_ID, [lo, hi, PARAM_WRITE, REG_CONTROL_MODE, v0, v1, v2, v3])
}

/// Read a TX frame back. `motor_type` is needed to unscale torque commands.
pub fn decode_command(bytes: &[u8], motor_type: MotorType) -> Result<DecodedCommand> {
    if bytes.len() != TX_FRAME_LEN {
        return Err(MotorError::MalformedFrame {
            reason: format!("Expected {} bytes, got {}", TX_FRAME_LEN, bytes.len()),
        });
    }
    if bytes[..2] != TX_TEMPLATE[..2] {
        return Err(MotorError::MalformedFrame {
            reason: format!("Invalid header: {:02X?}", &bytes[..2]),
        });
    }

    let can_id = u32::from_le_bytes([
        bytes[TX_CAN_ID],
        bytes[TX_CAN_ID + 1],
        bytes[TX_CAN_ID + 2],
        bytes[TX_CAN_ID + 3],
    ]);
    if can_id > MAX_STD_CAN_ID {
        return Err(MotorError::MalformedFrame {
            reason: format!("Extended CAN id 0x{:X}", can_id),
        });
    }
    let can_id = can_id as u16;
    let mut data = [0u8; 8];
    data.copy_from_slice(&bytes[TX_DATA..TX_DATA + 8]);

    if can_id == PARAM_CAN_ID {
        let address = u16::from_le_bytes([data[0], data[1]]);
        let value = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        return match (data[2], data[3], ControlMode::from_register_value(value)) {
            (PARAM_WRITE, REG_CONTROL_MODE, Some(mode)) => Ok(DecodedCommand::SetMode { address, mode }),
            _ => Err(MotorError::MalformedFrame {
                reason: format!("Unsupported parameter frame: {:02X?}", data),
            }),
        };
    }

    if data[..7].iter().all(|&b| b == 0xFF) {
        if let Some(command) = SpecialCommand::from_byte(data[7]) {
            return Ok(DecodedCommand::Special {
                address: can_id,
                command,
            });
        }
    }

    let (mode, address) = match can_id & 0x700 {
        0x000 => (ControlMode::Torque, can_id),
        0x100 => (ControlMode::Position, can_id - 0x100),
        0x200 => (ControlMode::Velocity, can_id - 0x200),
        _ => {
            return Err(MotorError::MalformedFrame {
                reason: format!("Unknown CAN id 0x{:03X}", can_id),
            });
        }
    };

    let value = match mode {
        ControlMode::Velocity | ControlMode::Position => f32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        ControlMode::Torque => {
            let t_max = motor_type.limits().t_max;
            let tau = (u16::from(data[6] & 0xF) << 8) | u16::from(data[7]);
            uint_to_float(tau, -t_max, t_max, TORQUE_BITS)
        }
    };

    Ok(DecodedCommand::Control { address, mode, value })
}

/// Validate one adapter report
pub fn decode_feedback(bytes: &[u8]) -> Result<RawFrame> {
    if bytes.len() != RX_FRAME_LEN {
        return Err(MotorError::MalformedFrame {
            reason: format!("Expected {} bytes, got {}", RX_FRAME_LEN, bytes.len()),
        });
    }
    if bytes[0] != RX_HEAD || bytes[RX_FRAME_LEN - 1] != RX_TAIL {
        return Err(MotorError::MalformedFrame {
            reason: format!(
                "Invalid framing: head=0x{:02X}, tail=0x{:02X}",
                bytes[0],
                bytes[RX_FRAME_LEN - 1]
            ),
        });
    }
    if bytes[1] != RX_CMD_RECEIVED {
        return Err(MotorError::MalformedFrame {
            reason: format!("Unexpected adapter report 0x{:02X}", bytes[1]),
        });
    }

    let can_id = u32::from_le_bytes([
        bytes[RX_CAN_ID],
        bytes[RX_CAN_ID + 1],
        bytes[RX_CAN_ID + 2],
        bytes[RX_CAN_ID + 3],
    ]);
    if can_id > MAX_STD_CAN_ID {
        return Err(MotorError::MalformedFrame {
            reason: format!("Extended CAN id 0x{:X}", can_id),
        });
    }

    let mut data = [0u8; 8];
    data.copy_from_slice(&bytes[RX_DATA..RX_DATA + 8]);
    Ok(RawFrame {
        can_id: can_id as u16,
        data,
    })
}

/// Split complete reports off the front of `buffer`.
///
/// A partial report at the end stays in the buffer. Bytes that cannot start a
/// report are dropped up to the next head byte and reported as malformed.
pub fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Result<RawFrame>> {
    let mut frames = Vec::new();

    while buffer.len() >= RX_FRAME_LEN {
        if buffer[0] == RX_HEAD && buffer[RX_FRAME_LEN - 1] == RX_TAIL {
            frames.push(decode_feedback(&buffer[..RX_FRAME_LEN]));
            buffer.drain(..RX_FRAME_LEN);
            continue;
        }

        let skip = buffer[1..]
            .iter()
            .position(|&b| b == RX_HEAD)
            .map(|p| p + 1)
            .unwrap_or(buffer.len());
        frames.push(Err(MotorError::MalformedFrame {
            reason: format!("Discarded {} unsynchronised byte(s)", skip),
        }));
        buffer.drain(..skip);
    }

    frames
}

impl RawFrame {
    /// Command address carried in the low nibble of the status byte
    pub fn motor_address(&self) -> u16 {
        u16::from(self.data[0] & 0x0F)
    }

    /// Recognise a register acknowledgement addressed to `command_address`
    pub fn register_ack(&self, command_address: u16) -> Option<RegisterAck> {
        let d = &self.data;
        let is_param = d[2] == PARAM_READ || d[2] == PARAM_WRITE;
        if is_param && u16::from_le_bytes([d[0], d[1]]) == command_address {
            Some(RegisterAck {
                register: d[3],
                value: u32::from_le_bytes([d[4], d[5], d[6], d[7]]),
            })
        } else {
            None
        }
    }

    /// Scale the payload into physical units for `motor_type`
    pub fn to_feedback(&self, motor_type: MotorType, received_at: Instant) -> FeedbackFrame {
        let limits = motor_type.limits();
        let d = &self.data;
        let q = (u16::from(d[1]) << 8) | u16::from(d[2]);
        let dq = (u16::from(d[3]) << 4) | u16::from(d[4] >> 4);
        let tau = (u16::from(d[4] & 0xF) << 8) | u16::from(d[5]);

        FeedbackFrame {
            source_address: self.can_id,
            motor_address: self.motor_address(),
            position: uint_to_float(q, -limits.p_max, limits.p_max, POSITION_BITS),
            velocity: uint_to_float(dq, -limits.v_max, limits.v_max, VELOCITY_BITS),
            torque: uint_to_float(tau, -limits.t_max, limits.t_max, TORQUE_BITS),
            fault_flags: d[0] >> 4,
            mos_temperature: d[6],
            rotor_temperature: d[7],
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm6006() -> Motor {
        Motor::new(MotorType::Dm6006, 0x01, 0x11, 6.0)
    }

    fn report(can_id: u8, data: [u8; 8]) -> [u8; RX_FRAME_LEN] {
        let mut bytes = [0u8; RX_FRAME_LEN];
        bytes[0] = RX_HEAD;
        bytes[1] = RX_CMD_RECEIVED;
        bytes[RX_CAN_ID] = can_id;
        bytes[RX_DATA..RX_DATA + 8].copy_from_slice(&data);
        bytes[RX_FRAME_LEN - 1] = RX_TAIL;
        bytes
    }

    #[test]
    fn test_velocity_frame_layout() {
        let frame = encode_command(&dm6006(), ControlMode::Velocity, 3.0).unwrap();
        assert_eq!(frame.len(), TX_FRAME_LEN);
        assert_eq!(&frame[..13], &TX_TEMPLATE[..13]);
        // CAN id 0x201, little-endian
        assert_eq!(&frame[13..17], &[0x01, 0x02, 0x00, 0x00]);
        assert_eq!(&frame[17..21], &[0x00, 0x08, 0x00, 0x00]);
        assert_eq!(&frame[21..25], &3.0f32.to_le_bytes());
        assert_eq!(&frame[25..29], &[0, 0, 0, 0]);
        assert_eq!(frame[29], 0x00);
    }

    #[test]
    fn test_velocity_round_trip_exact() {
        let motor = dm6006();
        for value in [-6.0, -3.0, -0.125, 0.0, 1.5, 3.0, 6.0] {
            let frame = encode_command(&motor, ControlMode::Velocity, value).unwrap();
            assert_eq!(
                decode_command(&frame, MotorType::Dm6006).unwrap(),
                DecodedCommand::Control {
                    address: 0x01,
                    mode: ControlMode::Velocity,
                    value,
                }
            );
        }
    }

    #[test]
    fn test_position_frame_carries_speed_limit() {
        let frame = encode_command(&dm6006(), ControlMode::Position, -1.25).unwrap();
        assert_eq!(&frame[13..15], &[0x01, 0x01]);
        assert_eq!(&frame[21..25], &(-1.25f32).to_le_bytes());
        assert_eq!(&frame[25..29], &6.0f32.to_le_bytes());
        assert_eq!(
            decode_command(&frame, MotorType::Dm6006).unwrap(),
            DecodedCommand::Control {
                address: 0x01,
                mode: ControlMode::Position,
                value: -1.25,
            }
        );
    }

    #[test]
    fn test_torque_round_trip_within_quantization() {
        let motor = dm6006();
        let step = 2.0 * 20.0 / 4095.0;
        for value in [-20.0, -7.3, 0.0, 3.0, 19.99] {
            let frame = encode_command(&motor, ControlMode::Torque, value).unwrap();
            match decode_command(&frame, MotorType::Dm6006).unwrap() {
                DecodedCommand::Control { address, mode, value: decoded } => {
                    assert_eq!(address, 0x01);
                    assert_eq!(mode, ControlMode::Torque);
                    assert!((decoded - value).abs() <= step, "{} decoded as {}", value, decoded);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        let motor = dm6006();
        for value in [6.01, -6.5, f32::NAN, f32::INFINITY] {
            let err = encode_command(&motor, ControlMode::Velocity, value).unwrap_err();
            assert!(matches!(err, MotorError::Range { mode: ControlMode::Velocity, .. }));
        }
        assert!(matches!(
            encode_command(&motor, ControlMode::Torque, 20.5),
            Err(MotorError::Range { limit, .. }) if limit == 20.0
        ));
        assert!(matches!(
            encode_command(&motor, ControlMode::Position, 13.0),
            Err(MotorError::Range { limit, .. }) if limit == 12.5
        ));
    }

    #[test]
    fn test_special_frames() {
        let frame = encode_special(0x02, SpecialCommand::Enable);
        assert_eq!(&frame[13..17], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&frame[21..29], &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC]);

        for command in [
            SpecialCommand::ClearError,
            SpecialCommand::Enable,
            SpecialCommand::Disable,
            SpecialCommand::SetZero,
        ] {
            let frame = encode_special(0x02, command);
            assert_eq!(
                decode_command(&frame, MotorType::Dm6006).unwrap(),
                DecodedCommand::Special { address: 0x02, command }
            );
        }
    }

    #[test]
    fn test_set_mode_frame() {
        let frame = encode_set_mode(0x01, ControlMode::Velocity);
        assert_eq!(&frame[13..17], &[0xFF, 0x07, 0x00, 0x00]);
        assert_eq!(&frame[21..29], &[0x01, 0x00, 0x55, 0x0A, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(
            decode_command(&frame, MotorType::Dm6006).unwrap(),
            DecodedCommand::SetMode {
                address: 0x01,
                mode: ControlMode::Velocity,
            }
        );
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        assert!(decode_command(&[0x55, 0xAA, 0x1E], MotorType::Dm6006).is_err());

        let mut frame = encode_special(0x01, SpecialCommand::Enable);
        frame[0] = 0x00;
        assert!(decode_command(&frame, MotorType::Dm6006).is_err());
    }

    #[test]
    fn test_feedback_scaling() {
        // fault 2, motor 1, q/dq at full scale, tau at minimum
        let bytes = report(0x11, [0x21, 0xFF, 0xFF, 0xFF, 0xF0, 0x00, 40, 35]);
        let raw = decode_feedback(&bytes).unwrap();
        assert_eq!(raw.can_id, 0x11);
        assert_eq!(raw.motor_address(), 0x01);

        let fb = raw.to_feedback(MotorType::Dm6006, Instant::now());
        assert_eq!(fb.source_address, 0x11);
        assert_eq!(fb.fault_flags, 2);
        assert!(fb.has_fault());
        assert!((fb.position - 12.5).abs() < 1e-4);
        assert!((fb.velocity - 45.0).abs() < 1e-4);
        assert!((fb.torque + 20.0).abs() < 1e-4);
        assert_eq!(fb.mos_temperature, 40);
        assert_eq!(fb.rotor_temperature, 35);
    }

    #[test]
    fn test_feedback_near_zero() {
        // Mid-scale fields decode to approximately zero
        let bytes = report(0x11, [0x01, 0x80, 0x00, 0x80, 0x08, 0x00, 0, 0]);
        let fb = decode_feedback(&bytes)
            .unwrap()
            .to_feedback(MotorType::Dm6006, Instant::now());
        assert!(fb.position.abs() < 1e-3);
        assert!(fb.velocity.abs() < 0.02);
        assert!(fb.torque.abs() < 0.01);
        assert!(!fb.has_fault());
    }

    #[test]
    fn test_decode_feedback_malformed() {
        let good = report(0x11, [0; 8]);

        assert!(matches!(decode_feedback(&good[..15]), Err(MotorError::MalformedFrame { .. })));

        let mut bad_tail = good;
        bad_tail[15] = 0x00;
        assert!(matches!(decode_feedback(&bad_tail), Err(MotorError::MalformedFrame { .. })));

        let mut bad_cmd = good;
        bad_cmd[1] = 0x12;
        assert!(matches!(decode_feedback(&bad_cmd), Err(MotorError::MalformedFrame { .. })));
    }

    #[test]
    fn test_drain_frames_resynchronises() {
        let first = report(0x11, [0x01; 8]);
        let second = report(0x12, [0x02; 8]);

        let mut buffer = vec![0x00, 0x13];
        buffer.extend_from_slice(&first);
        buffer.extend_from_slice(&second);
        // Partial third report
        buffer.extend_from_slice(&first[..5]);

        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Err(MotorError::MalformedFrame { .. })));
        assert_eq!(frames[1].as_ref().unwrap().can_id, 0x11);
        assert_eq!(frames[2].as_ref().unwrap().can_id, 0x12);
        assert_eq!(buffer, first[..5].to_vec());
    }

    #[test]
    fn test_register_ack() {
        let bytes = report(0x11, [0x01, 0x00, 0x55, 0x0A, 0x03, 0x00, 0x00, 0x00]);
        let raw = decode_feedback(&bytes).unwrap();
        assert_eq!(
            raw.register_ack(0x01),
            Some(RegisterAck {
                register: 10,
                value: 3,
            })
        );
        assert_eq!(raw.register_ack(0x02), None);
    }

    #[test]
    fn test_fixed_point_endpoints() {
        assert_eq!(float_to_uint(-12.5, -12.5, 12.5, 16), 0);
        assert_eq!(float_to_uint(12.5, -12.5, 12.5, 16), 0xFFFF);
        assert_eq!(float_to_uint(100.0, -12.5, 12.5, 16), 0xFFFF);
        assert_eq!(float_to_uint(5.0, -5.0, 5.0, 12), 0x0FFF);
        assert!((uint_to_float(0x0FFF, -45.0, 45.0, 12) - 45.0).abs() < 1e-4);
    }
}
