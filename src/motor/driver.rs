// Driver session for a DaMiao actuator bus
//
// Owns the transport and the motor registry, checks command preconditions,
// and guarantees a zero + disable + close sequence on every exit path.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::damiao::{self, ControlCommand, SpecialCommand};
use super::error::{BatchReport, MotorError, Result, ShutdownReport, ShutdownStep};
use super::registry::{ControlMode, Motor, MotorHandle, MotorRegistry, MotorType};
use super::transport::{SerialTransport, Transport};
use crate::config::SessionConfig;

/// Open the configured serial port and start an empty session
pub fn open_session(config: &SessionConfig) -> Result<Session<SerialTransport>> {
    info!("Opening motor bus on {}", config.port);
    let transport = SerialTransport::open(&config.port, config.baud_rate, config.read_timeout())?;
    Ok(Session::new(transport, config.clone()))
}

/// Result of [`Session::run_scoped`]
#[derive(Debug)]
pub struct ScopedOutcome<R> {
    pub result: Result<R>,
    pub shutdown: ShutdownReport,
}

/// One driver session over an exclusively held transport
pub struct Session<T: Transport> {
    transport: T,
    registry: MotorRegistry,
    config: SessionConfig,
    rx_buffer: Vec<u8>,
    closed: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            registry: MotorRegistry::new(),
            config,
            rx_buffer: Vec::new(),
            closed: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &MotorRegistry {
        &self.registry
    }

    pub fn motor(&self, handle: MotorHandle) -> Result<&Motor> {
        self.registry.get(handle)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            return Err(MotorError::Closed);
        }
        self.transport.send(frame)
    }

    /// Add a motor to the session. Nothing is sent on the bus.
    pub fn register_motor(
        &mut self,
        command_address: u16,
        feedback_address: u16,
        motor_type: MotorType,
    ) -> Result<MotorHandle> {
        let max_speed = self.config.max_speed;
        if !max_speed.is_finite() || max_speed <= 0.0 {
            return Err(MotorError::Config(format!("max_speed must be positive, got {}", max_speed)));
        }
        let motor = Motor::new(motor_type, command_address, feedback_address, max_speed);
        self.registry.register(motor)
    }

    pub fn enable(&mut self, handle: MotorHandle) -> Result<()> {
        self.registry.get(handle)?;
        self.transmit(&damiao::encode_special(handle.address(), SpecialCommand::Enable))?;
        self.registry.mark_enabled(handle)?;
        info!("Motor 0x{:02X} enabled", handle.address());
        Ok(())
    }

    /// Disable a motor. The motor is considered disabled afterwards even if the
    /// bus write fails; the write error is still returned.
    pub fn disable(&mut self, handle: MotorHandle) -> Result<()> {
        self.registry.get(handle)?;
        let sent = self.transmit(&damiao::encode_special(handle.address(), SpecialCommand::Disable));
        self.registry.mark_disabled(handle)?;
        match &sent {
            Ok(()) => info!("Motor 0x{:02X} disabled", handle.address()),
            Err(e) => warn!("Disable frame for motor 0x{:02X} failed: {}", handle.address(), e),
        }
        sent
    }

    /// Switch the control mode of an enabled motor
    pub fn set_mode(&mut self, handle: MotorHandle, mode: ControlMode) -> Result<()> {
        let motor = self.registry.get(handle)?;
        if !motor.is_enabled() {
            return Err(MotorError::NotEnabled {
                address: handle.address(),
            });
        }
        self.transmit(&damiao::encode_set_mode(handle.address(), mode))?;
        self.registry.set_mode(handle, mode)?;
        self.registry.get_mut(handle)?.awaiting_ack = Some(damiao::REG_CONTROL_MODE);
        info!("Motor 0x{:02X} switched to {:?} mode", handle.address(), mode);
        Ok(())
    }

    /// Zero the encoder at the current shaft position
    pub fn set_zero_position(&mut self, handle: MotorHandle) -> Result<()> {
        self.registry.get(handle)?;
        self.transmit(&damiao::encode_special(handle.address(), SpecialCommand::SetZero))
    }

    /// Clear a latched fault
    pub fn clear_error(&mut self, handle: MotorHandle) -> Result<()> {
        self.registry.get(handle)?;
        self.transmit(&damiao::encode_special(handle.address(), SpecialCommand::ClearError))
    }

    /// Send a set-point after checking, in order: registered, enabled, mode, range.
    /// Nothing is transmitted unless every check passes.
    pub fn send_command(&mut self, handle: MotorHandle, mode: ControlMode, value: f32) -> Result<()> {
        let motor = self.registry.get(handle)?;
        if !motor.is_enabled() {
            return Err(MotorError::NotEnabled {
                address: handle.address(),
            });
        }
        if motor.mode() != Some(mode) {
            return Err(MotorError::ModeMismatch {
                address: handle.address(),
                expected: mode,
                actual: motor.mode(),
            });
        }

        let frame = damiao::encode_command(motor, mode, value)?;
        self.transmit(&frame)?;

        let command = ControlCommand {
            address: handle.address(),
            mode,
            value,
            issued_at: Instant::now(),
        };
        self.registry.get_mut(handle)?.last_command = Some(command);
        Ok(())
    }

    /// Velocity set-point in rad/s
    pub fn send_velocity(&mut self, handle: MotorHandle, velocity: f32) -> Result<()> {
        self.send_command(handle, ControlMode::Velocity, velocity)
    }

    /// Position set-point in rad, travelled at the motor's speed limit
    pub fn send_position(&mut self, handle: MotorHandle, position: f32) -> Result<()> {
        self.send_command(handle, ControlMode::Position, position)
    }

    /// Feed-forward torque in N·m
    pub fn send_torque(&mut self, handle: MotorHandle, torque: f32) -> Result<()> {
        self.send_command(handle, ControlMode::Torque, torque)
    }

    /// Dispatch velocities in the given order. A failing motor does not stop
    /// the others; every failure is collected in the report.
    pub fn send_velocities(&mut self, commands: &[(MotorHandle, f32)]) -> BatchReport {
        let mut report = BatchReport::default();
        for &(handle, velocity) in commands {
            match self.send_velocity(handle, velocity) {
                Ok(()) => report.sent.push(handle.address()),
                Err(e) => {
                    warn!("Velocity {} for motor 0x{:02X} rejected: {}", velocity, handle.address(), e);
                    report.failures.push((handle.address(), e));
                }
            }
        }
        report
    }

    /// Read once from the link and apply any feedback to the motor cache.
    ///
    /// Returns the number of feedback frames applied. Malformed or unknown
    /// frames are logged and dropped; a silent link is a `Timeout`.
    pub fn poll_feedback(&mut self) -> Result<usize> {
        if self.closed {
            return Err(MotorError::Closed);
        }
        let bytes = self.transport.receive(self.config.read_timeout())?;
        self.rx_buffer.extend_from_slice(&bytes);

        let now = Instant::now();
        let mut applied = 0;
        for frame in damiao::drain_frames(&mut self.rx_buffer) {
            let raw = match frame {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Dropping frame: {}", e);
                    continue;
                }
            };

            let motor = if raw.can_id == 0 {
                self.registry.by_command_address_mut(raw.motor_address())
            } else {
                self.registry.by_feedback_address_mut(raw.can_id)
            };
            let Some(motor) = motor else {
                debug!("Ignoring frame from unregistered id 0x{:03X}", raw.can_id);
                continue;
            };

            // Only a write still waiting for its reply can claim the frame
            let ack = motor
                .awaiting_ack
                .and_then(|register| raw.register_ack(motor.command_address()).filter(|a| a.register == register));
            if let Some(ack) = ack {
                debug!(
                    "Motor 0x{:02X} register {} = {}",
                    motor.command_address(),
                    ack.register,
                    ack.value
                );
                if ack.register == damiao::REG_CONTROL_MODE
                    && motor.mode().map(ControlMode::register_value) != Some(ack.value)
                {
                    warn!(
                        "Motor 0x{:02X} acknowledged control mode {}, expected {:?}",
                        motor.command_address(),
                        ack.value,
                        motor.mode()
                    );
                }
                motor.awaiting_ack = None;
                continue;
            }

            let feedback = raw.to_feedback(motor.motor_type(), now);
            if feedback.has_fault() {
                warn!(
                    "Motor 0x{:02X} reports fault 0x{:X}",
                    motor.command_address(),
                    feedback.fault_flags
                );
            }
            motor.last_feedback = Some(feedback);
            applied += 1;
        }

        Ok(applied)
    }

    /// Last feedback seen for a motor
    pub fn feedback(&self, handle: MotorHandle) -> Result<Option<&damiao::FeedbackFrame>> {
        Ok(self.registry.get(handle)?.last_feedback())
    }

    /// Stop every enabled motor, disable it, then close the link.
    ///
    /// Each step runs even if an earlier one failed. Calling it again does nothing.
    pub fn close(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.closed {
            return report;
        }

        info!("Shutting down motor bus");
        for handle in self.registry.enabled_handles() {
            let address = handle.address();

            // Zero velocity goes out regardless of the active mode
            let zeroed = self
                .registry
                .get(handle)
                .and_then(|motor| damiao::encode_command(motor, ControlMode::Velocity, 0.0))
                .and_then(|frame| self.transport.send(&frame));
            report.record(ShutdownStep::ZeroCommand { address }, zeroed);

            let disabled = self.disable(handle);
            report.record(ShutdownStep::Disable { address }, disabled);
        }

        report.record(ShutdownStep::CloseTransport, self.transport.close());
        self.closed = true;

        if report.is_clean() {
            info!("Motors disabled, link closed");
        } else {
            warn!("Shutdown finished with errors: {}", report);
        }
        report
    }

    /// Run `body` against this session, then shut down no matter how it ended
    pub fn run_scoped<R, F>(mut self, body: F) -> ScopedOutcome<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        let result = body(&mut self);
        if let Err(e) = &result {
            warn!("Session body failed: {}", e);
        }
        let shutdown = self.close();
        ScopedOutcome { result, shutdown }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        // Covers panics and early returns that skipped close()
        if !self.closed {
            let report = self.close();
            if !report.is_clean() {
                warn!("Failed to shut down motors on drop: {}", report);
            }
        }
    }
}
