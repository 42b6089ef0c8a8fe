//! In-memory axis controller
//!
//! Speaks the same frames as the real controllers. Position advances with
//! elapsed time at the commanded speed, so motion takes real (if short)
//! time and can be aborted mid-flight. Every decoded command is logged
//! for assertions.

use crate::axis::HomeSensor;
use crate::error::AxisResult;
use crate::protocol::{opcodes, AxisCommand, AxisResponse, Direction};
use crate::transport::SerialTransport;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::trace;

/// Shaft angle counts per motor turn
const SHAFT_COUNTS_PER_TURN: i64 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Running,
    Target(i32),
}

#[derive(Debug)]
struct ServoModel {
    address: u8,
    pulses_per_motor_turn: i64,
    position: f64,
    last_update: Instant,
    speed: f64,
    direction: Direction,
    motion: Motion,
    enabled: bool,
    home_position: Option<i32>,
    home_tripped: bool,
    silent: bool,
    rejected: HashSet<u8>,
    log: Vec<AxisCommand>,
}

impl ServoModel {
    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        let before = self.position;

        match self.motion {
            Motion::Idle => return,
            Motion::Running => {
                self.position += self.direction.sign() * self.speed * dt;
            }
            Motion::Target(target) => {
                let remaining = target as f64 - self.position;
                let step = self.speed * dt;
                if remaining.abs() <= step {
                    self.position = target as f64;
                    self.motion = Motion::Idle;
                } else {
                    self.position += step.copysign(remaining);
                }
            }
        }

        if let Some(home) = self.home_position {
            let home = home as f64;
            if before != self.position && (before - home) * (self.position - home) <= 0.0 {
                self.home_tripped = true;
            }
        }
    }

    fn pulses(&self) -> i32 {
        self.position.round() as i32
    }

    fn shaft_angle(&self) -> i64 {
        self.pulses() as i64 * SHAFT_COUNTS_PER_TURN / self.pulses_per_motor_turn.max(1)
    }

    fn apply(&mut self, cmd: &AxisCommand) -> AxisResponse {
        let address = self.address;
        if self.rejected.contains(&cmd.opcode) {
            return AxisResponse::status(address, false);
        }

        let ok = match cmd.opcode {
            opcodes::READ_ENCODER => {
                let encoder = self.shaft_angle().rem_euclid(SHAFT_COUNTS_PER_TURN) as u16;
                return AxisResponse::new(address, encoder.to_le_bytes());
            }
            opcodes::READ_PULSE_COUNT => {
                return AxisResponse::new(address, self.pulses().to_le_bytes());
            }
            opcodes::READ_SHAFT_ANGLE => {
                let angle = self.shaft_angle().clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                return AxisResponse::new(address, angle.to_le_bytes());
            }
            opcodes::READ_ENABLE => self.enabled,
            opcodes::SET_SPEED => match <[u8; 2]>::try_from(cmd.payload.as_slice()) {
                Ok(bytes) => {
                    self.speed = u16::from_le_bytes(bytes) as f64;
                    true
                }
                Err(_) => false,
            },
            opcodes::SET_DIRECTION => match cmd.payload.as_slice() {
                [0] => {
                    self.direction = Direction::Forward;
                    true
                }
                [1] => {
                    self.direction = Direction::Reverse;
                    true
                }
                _ => false,
            },
            opcodes::SET_ZERO => {
                self.position = 0.0;
                self.motion = Motion::Idle;
                self.home_tripped = false;
                true
            }
            opcodes::RETURN_TO_ZERO => self.begin_move(0),
            opcodes::SET_ENABLE => match cmd.payload.as_slice() {
                [flag @ (0 | 1)] => {
                    self.enabled = *flag == 1;
                    if !self.enabled {
                        self.motion = Motion::Idle;
                    }
                    true
                }
                _ => false,
            },
            opcodes::START => {
                if self.enabled && self.speed > 0.0 {
                    self.motion = Motion::Running;
                    self.home_tripped = false;
                    true
                } else {
                    false
                }
            }
            opcodes::STOP => {
                self.motion = Motion::Idle;
                true
            }
            opcodes::MOVE_BY_PULSES => match <[u8; 4]>::try_from(cmd.payload.as_slice()) {
                Ok(bytes) => {
                    let target = self.pulses().saturating_add(i32::from_le_bytes(bytes));
                    self.begin_move(target)
                }
                Err(_) => false,
            },
            opcodes::MOVE_TO_TARGET => match <[u8; 4]>::try_from(cmd.payload.as_slice()) {
                Ok(bytes) => self.begin_move(i32::from_le_bytes(bytes)),
                Err(_) => false,
            },
            _ => false,
        };
        AxisResponse::status(address, ok)
    }

    fn begin_move(&mut self, target: i32) -> bool {
        if !self.enabled || self.speed <= 0.0 {
            return false;
        }
        self.motion = if target == self.pulses() {
            Motion::Idle
        } else {
            Motion::Target(target)
        };
        true
    }
}

/// Inspection and fault-injection handle onto a simulated servo
#[derive(Debug, Clone)]
pub struct ServoHandle {
    model: Arc<Mutex<ServoModel>>,
}

impl ServoHandle {
    fn model(&self) -> MutexGuard<'_, ServoModel> {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        model.advance(Instant::now());
        model
    }

    pub fn address(&self) -> u8 {
        self.model().address
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<AxisCommand> {
        self.model().log.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.model().log.iter().map(|c| c.opcode).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.model().log.iter().filter(|c| c.opcode == opcode).count()
    }

    pub fn clear_commands(&self) {
        self.model().log.clear();
    }

    pub fn position(&self) -> i32 {
        self.model().pulses()
    }

    pub fn set_position(&self, pulses: i32) {
        self.model().position = pulses as f64;
    }

    pub fn is_running(&self) -> bool {
        self.model().motion != Motion::Idle
    }

    pub fn speed(&self) -> u16 {
        self.model().speed as u16
    }

    /// Stop answering, so every exchange times out
    pub fn set_silent(&self, silent: bool) {
        self.model().silent = silent;
    }

    /// Answer `opcode` with a failure status from now on
    pub fn reject_opcode(&self, opcode: u8) {
        self.model().rejected.insert(opcode);
    }

    pub fn set_home_position(&self, pulses: Option<i32>) {
        self.model().home_position = pulses;
    }
}

impl HomeSensor for ServoHandle {
    fn is_homed(&self) -> bool {
        self.model().home_tripped
    }
}

/// Transport end of a simulated servo
pub struct SimulatedServo {
    name: String,
    handle: ServoHandle,
    pending: Vec<u8>,
}

impl SimulatedServo {
    /// A servo at `address` whose home switch sits at `home_position` pulses
    pub fn new(address: u8, pulses_per_motor_turn: u32, home_position: Option<i32>) -> Self {
        let model = ServoModel {
            address,
            pulses_per_motor_turn: pulses_per_motor_turn as i64,
            position: 0.0,
            last_update: Instant::now(),
            speed: 0.0,
            direction: Direction::Forward,
            motion: Motion::Idle,
            enabled: true,
            home_position,
            home_tripped: false,
            silent: false,
            rejected: HashSet::new(),
            log: Vec::new(),
        };
        Self {
            name: format!("simulator:0x{:02X}", address),
            handle: ServoHandle {
                model: Arc::new(Mutex::new(model)),
            },
            pending: Vec::new(),
        }
    }

    pub fn handle(&self) -> ServoHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl SerialTransport for SimulatedServo {
    async fn write(&mut self, bytes: &[u8]) -> AxisResult<()> {
        // Garbled frames are dropped like a real controller would
        let Ok(cmd) = AxisCommand::decode(bytes) else {
            trace!("{}: dropped unparseable frame {:02X?}", self.name, bytes);
            return Ok(());
        };

        let mut model = self.handle.model();
        if cmd.address != model.address {
            return Ok(());
        }
        let response = model.apply(&cmd);
        model.log.push(cmd);
        if !model.silent {
            self.pending.extend_from_slice(&response.encode());
        }
        Ok(())
    }

    async fn read_available(&mut self) -> AxisResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.pending))
    }

    async fn close(&mut self) -> AxisResult<()> {
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum;
    use std::time::Duration;

    async fn exchange(servo: &mut SimulatedServo, cmd: AxisCommand) -> AxisResponse {
        servo.write(&cmd.encode()).await.unwrap();
        let frame = servo.read_available().await.unwrap();
        AxisResponse::decode(&cmd, &frame).unwrap()
    }

    #[tokio::test]
    async fn test_pulse_count_starts_at_zero() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        let response = exchange(
            &mut servo,
            AxisCommand::new(0xE0, opcodes::READ_PULSE_COUNT, Vec::new()),
        )
        .await;
        assert_eq!(response.value_i32().unwrap(), 0);
        assert_eq!(servo.handle().opcodes(), vec![opcodes::READ_PULSE_COUNT]);
    }

    #[tokio::test]
    async fn test_ignores_other_address_and_bad_checksum() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        servo
            .write(&AxisCommand::new(0xE1, opcodes::STOP, Vec::new()).encode())
            .await
            .unwrap();
        servo.write(&[0xE0, opcodes::STOP, 0x00]).await.unwrap();
        assert!(servo.read_available().await.unwrap().is_empty());
        assert!(servo.handle().commands().is_empty());
    }

    #[tokio::test]
    async fn test_move_to_target_advances_with_time() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        let handle = servo.handle();
        exchange(
            &mut servo,
            AxisCommand::new(0xE0, opcodes::SET_SPEED, 20_000u16.to_le_bytes()),
        )
        .await;
        let response = exchange(
            &mut servo,
            AxisCommand::new(0xE0, opcodes::MOVE_TO_TARGET, 1_000i32.to_le_bytes()),
        )
        .await;
        assert!(response.is_ok());
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.position(), 1_000);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_start_requires_speed() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        let response = exchange(&mut servo, AxisCommand::new(0xE0, opcodes::START, Vec::new())).await;
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn test_home_switch_trips_when_crossed() {
        let mut servo = SimulatedServo::new(0xE1, 6400, Some(-50));
        let handle = servo.handle();
        exchange(
            &mut servo,
            AxisCommand::new(0xE1, opcodes::SET_SPEED, 5_000u16.to_le_bytes()),
        )
        .await;
        exchange(&mut servo, AxisCommand::new(0xE1, opcodes::SET_DIRECTION, vec![1])).await;
        exchange(&mut servo, AxisCommand::new(0xE1, opcodes::START, Vec::new())).await;
        assert!(!handle.is_homed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_homed());
        assert!(handle.position() < -50);
    }

    #[tokio::test]
    async fn test_silent_servo_sends_nothing() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        servo.handle().set_silent(true);
        let frame = AxisCommand::new(0xE0, opcodes::STOP, Vec::new()).encode();
        assert_eq!(frame[2], checksum(&frame[..2]));
        servo.write(&frame).await.unwrap();
        assert!(servo.read_available().await.unwrap().is_empty());
        assert_eq!(servo.handle().count(opcodes::STOP), 1);
    }

    #[tokio::test]
    async fn test_rejected_opcode() {
        let mut servo = SimulatedServo::new(0xE0, 6400, None);
        servo.handle().reject_opcode(opcodes::STOP);
        let response = exchange(&mut servo, AxisCommand::new(0xE0, opcodes::STOP, Vec::new())).await;
        assert!(!response.is_ok());
    }
}
