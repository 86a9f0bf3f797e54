// Bring-up and script sequencer
//
// The sequencer issues commands, reads back feedback once per step and waits.
// Dropping its future (e.g. on Ctrl+C) stops it between commands; the caller
// then closes the session.

use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::MotorSpec;
use crate::messages::Script;
use crate::motor::{ControlMode, MotorError, MotorHandle, Session, Transport};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error("Script references motor {index}, only {available} configured")]
    UnknownMotor { index: usize, available: usize },

    #[error("Step '{step}': {} motor(s) rejected their command", .failures.len())]
    PartialDispatch {
        step: String,
        failures: Vec<(u16, MotorError)>,
    },
}

/// Register, enable and switch every configured motor to velocity mode
pub fn bring_up<T: Transport>(session: &mut Session<T>, motors: &[MotorSpec]) -> Result<Vec<MotorHandle>, MotorError> {
    let mut handles = Vec::with_capacity(motors.len());
    for spec in motors {
        handles.push(session.register_motor(spec.command_id, spec.feedback_id, spec.motor_type)?);
    }

    for &handle in &handles {
        session.enable(handle)?;
        session.set_mode(handle, ControlMode::Velocity)?;
    }

    info!("{} motor(s) ready for velocity control", handles.len());
    Ok(handles)
}

/// Runs a [`Script`] against a set of brought-up motors
pub struct Sequencer {
    script: Script,
    motors: Vec<MotorHandle>,
}

impl Sequencer {
    pub fn new(script: Script, motors: Vec<MotorHandle>) -> Result<Self, RuntimeError> {
        if let Some(index) = script.max_motor_index() {
            if index >= motors.len() {
                return Err(RuntimeError::UnknownMotor {
                    index,
                    available: motors.len(),
                });
            }
        }
        Ok(Self { script, motors })
    }

    pub async fn run<T: Transport>(&self, session: &mut Session<T>) -> Result<(), RuntimeError> {
        let total = self.script.steps.len();

        for (i, step) in self.script.steps.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, total, step.label);
            let started = Instant::now();

            let commands: Vec<(MotorHandle, f32)> = step
                .targets
                .iter()
                .map(|t| (self.motors[t.motor], t.velocity))
                .collect();

            let report = session.send_velocities(&commands);
            if !report.is_ok() {
                warn!("Step '{}' aborted the sequence", step.label);
                return Err(RuntimeError::PartialDispatch {
                    step: step.label.clone(),
                    failures: report.failures,
                });
            }

            self.check_feedback(session, &step.label);
            sleep_until(started + step.hold()).await;
        }

        info!("Sequence complete");
        Ok(())
    }

    /// One feedback read per step. A silent link is not an error here.
    fn check_feedback<T: Transport>(&self, session: &mut Session<T>, label: &str) {
        match session.poll_feedback() {
            Ok(applied) => debug!("Step '{}': {} feedback frame(s)", label, applied),
            Err(MotorError::Timeout(_)) => debug!("Step '{}': no feedback", label),
            Err(e) => warn!("Step '{}': feedback read failed: {}", label, e),
        }

        for &handle in &self.motors {
            if let Ok(Some(feedback)) = session.feedback(handle) {
                if feedback.has_fault() {
                    warn!(
                        "Step '{}': motor 0x{:02X} faulted (0x{:X})",
                        label,
                        handle.address(),
                        feedback.fault_flags
                    );
                }
            }
        }
    }
}
