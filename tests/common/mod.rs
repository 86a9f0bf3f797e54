#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use damiao_motor_runtime::config::SessionConfig;
use damiao_motor_runtime::motor::damiao::decode_command;
use damiao_motor_runtime::motor::{
    ControlMode, DecodedCommand, MotorError, MotorType, Session, SpecialCommand, Transport,
};

/// Everything the mock saw, shared with the test after the session is gone
#[derive(Default)]
pub struct BusLog {
    pub sent: Vec<Vec<u8>>,
    pub receive_calls: usize,
    pub close_calls: usize,
}

impl BusLog {
    pub fn commands(&self) -> Vec<DecodedCommand> {
        self.sent
            .iter()
            .map(|frame| decode_command(frame, MotorType::Dm6006).unwrap())
            .collect()
    }

    pub fn velocities_for(&self, address: u16) -> Vec<f32> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                DecodedCommand::Control {
                    address: a,
                    mode: ControlMode::Velocity,
                    value,
                } if a == address => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn count_special(&self, address: u16, command: SpecialCommand) -> usize {
        self.commands()
            .into_iter()
            .filter(|c| *c == DecodedCommand::Special { address, command })
            .count()
    }
}

type SendFault = Box<dyn Fn(&DecodedCommand) -> bool>;

/// Records every frame; optionally fails selected sends or the close
pub struct MockTransport {
    log: Rc<RefCell<BusLog>>,
    inbound: VecDeque<Vec<u8>>,
    fail_send: Option<SendFault>,
    fail_close: bool,
}

impl MockTransport {
    pub fn new() -> (Self, Rc<RefCell<BusLog>>) {
        let log = Rc::new(RefCell::new(BusLog::default()));
        let transport = Self {
            log: Rc::clone(&log),
            inbound: VecDeque::new(),
            fail_send: None,
            fail_close: false,
        };
        (transport, log)
    }

    pub fn failing_send(mut self, fault: impl Fn(&DecodedCommand) -> bool + 'static) -> Self {
        self.fail_send = Some(Box::new(fault));
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_inbound(mut self, chunk: Vec<u8>) -> Self {
        self.inbound.push_back(chunk);
        self
    }
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), MotorError> {
        if let Some(fault) = &self.fail_send {
            let decoded = decode_command(frame, MotorType::Dm6006)?;
            if fault(&decoded) {
                return Err(MotorError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "injected")));
            }
        }
        self.log.borrow_mut().sent.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, MotorError> {
        self.log.borrow_mut().receive_calls += 1;
        self.inbound.pop_front().ok_or(MotorError::Timeout(timeout))
    }

    fn close(&mut self) -> Result<(), MotorError> {
        self.log.borrow_mut().close_calls += 1;
        if self.fail_close {
            return Err(MotorError::Io(io::Error::other("injected close failure")));
        }
        Ok(())
    }
}

pub fn session(transport: MockTransport) -> Session<MockTransport> {
    Session::new(transport, SessionConfig::default())
}

/// One 16-byte adapter report for a received CAN frame
pub fn report(can_id: u8, data: [u8; 8]) -> Vec<u8> {
    let mut bytes = vec![0xAA, 0x11, 0x00, can_id, 0x00, 0x00, 0x00];
    bytes.extend_from_slice(&data);
    bytes.push(0x55);
    bytes
}
