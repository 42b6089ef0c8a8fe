//! Axis command channel
//!
//! One [`Axis`] per controller. Each high-level operation is a single
//! command/response exchange; motion operations additionally poll the
//! pulse count until the controller reaches its target.

use crate::error::{AxisError, AxisResult};
use crate::protocol::{opcodes, AxisCommand, AxisResponse, Direction};
use crate::transport::SharedTransport;
use crate::wait::{poll_until, WaitOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Interval between reads while waiting for a response frame
const RESPONSE_POLL: Duration = Duration::from_millis(5);

/// Smallest non-zero speed the controller accepts
const MIN_SPEED: u16 = 1;

// =============================================================================
// HOME SENSOR
// =============================================================================

/// External "axis is at home" predicate consulted by [`Axis::find_home`]
pub trait HomeSensor: Send + Sync {
    fn is_homed(&self) -> bool;
}

/// An axis without a home switch; homing always times out
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHomeSwitch;

impl HomeSensor for NoHomeSwitch {
    fn is_homed(&self) -> bool {
        false
    }
}

/// Home switch wired to a GPIO line exported through sysfs
/// (`/sys/class/gpio/gpioN/value` holds `0` or `1`)
#[derive(Debug, Clone)]
pub struct SysfsHomeSwitch {
    path: PathBuf,
    active_high: bool,
}

impl SysfsHomeSwitch {
    pub fn new(path: impl Into<PathBuf>, active_high: bool) -> Self {
        Self {
            path: path.into(),
            active_high,
        }
    }
}

impl HomeSensor for SysfsHomeSwitch {
    fn is_homed(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(value) => (value.trim() == "1") == self.active_high,
            Err(e) => {
                warn!("Cannot read home switch {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Conversion between axis degrees and controller pulses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisGeometry {
    pub steps_per_rev: u32,
    pub microsteps: u32,
    pub gear_ratio: f64,
    /// Positive degrees produce negative pulses
    pub reversed: bool,
}

impl Default for AxisGeometry {
    fn default() -> Self {
        Self {
            steps_per_rev: 200,
            microsteps: 32,
            gear_ratio: 100.0,
            reversed: false,
        }
    }
}

impl AxisGeometry {
    pub fn pulses_per_motor_turn(&self) -> u32 {
        self.steps_per_rev * self.microsteps
    }

    pub fn pulses_per_degree(&self) -> f64 {
        self.pulses_per_motor_turn() as f64 * self.gear_ratio / 360.0
    }

    fn sign(&self) -> f64 {
        if self.reversed {
            -1.0
        } else {
            1.0
        }
    }

    pub fn degrees_to_pulses(&self, degrees: f64) -> i32 {
        let pulses = (degrees * self.pulses_per_degree() * self.sign()).round();
        pulses.clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }

    pub fn pulses_to_degrees(&self, pulses: i32) -> f64 {
        pulses as f64 / self.pulses_per_degree() * self.sign()
    }

    /// Controller speed and direction for a signed rate in degrees/second
    pub fn rate_to_speed(&self, degrees_per_sec: f64) -> (Direction, u16) {
        let direction = Direction::from_rate(degrees_per_sec * self.sign());
        let pulses = (degrees_per_sec.abs() * self.pulses_per_degree()).round();
        let speed = pulses.clamp(MIN_SPEED as f64, u16::MAX as f64) as u16;
        (direction, speed)
    }
}

// =============================================================================
// TIMING
// =============================================================================

#[derive(Debug, Clone)]
pub struct AxisTiming {
    /// Bound on a single command/response exchange
    pub response_timeout: Duration,
    /// Interval between pulse-count polls while moving
    pub poll_interval: Duration,
    /// Bound on a move-to-target
    pub move_timeout: Duration,
    /// Bound on the home search
    pub homing_timeout: Duration,
    /// Signed home search rate in degrees/second
    pub home_rate: f64,
    /// Pulses from target that count as arrived
    pub position_tolerance: i32,
}

impl Default for AxisTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            move_timeout: Duration::from_secs(300),
            homing_timeout: Duration::from_secs(120),
            home_rate: 1.0,
            position_tolerance: 2,
        }
    }
}

// =============================================================================
// AXIS
// =============================================================================

/// Command channel to one axis controller
pub struct Axis {
    name: String,
    address: u8,
    transport: SharedTransport,
    geometry: AxisGeometry,
    timing: AxisTiming,
    home: Arc<dyn HomeSensor>,
}

impl std::fmt::Debug for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Axis")
            .field("name", &self.name)
            .field("address", &format_args!("0x{:02X}", self.address))
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl Axis {
    pub fn new(
        name: impl Into<String>,
        address: u8,
        transport: SharedTransport,
        geometry: AxisGeometry,
        timing: AxisTiming,
        home: Arc<dyn HomeSensor>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            transport,
            geometry,
            timing,
            home,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn geometry(&self) -> &AxisGeometry {
        &self.geometry
    }

    pub fn timing(&self) -> &AxisTiming {
        &self.timing
    }

    /// One command/response exchange
    ///
    /// Stale bytes are discarded first, then the frame is written and the
    /// port is polled until a complete response arrives or the response
    /// timeout elapses.
    pub async fn send_command(&self, opcode: u8, payload: impl Into<Vec<u8>>) -> AxisResult<AxisResponse> {
        let cmd = AxisCommand::new(self.address, opcode, payload);
        let frame = cmd.encode();
        let expected = cmd.expected_response_len();

        let mut port = self.transport.lock().await;
        let stale = port.read_available().await?;
        if !stale.is_empty() {
            debug!("{}: discarded {} stale bytes", self.name, stale.len());
        }

        trace!("{} TX {:02X?}", self.name, frame);
        port.write(&frame).await?;

        let deadline = Instant::now() + self.timing.response_timeout;
        let mut received = Vec::with_capacity(expected);
        loop {
            received.extend(port.read_available().await?);
            if received.len() >= expected {
                break;
            }
            if Instant::now() >= deadline {
                return Err(AxisError::Timeout {
                    address: self.address,
                    opcode,
                    duration: self.timing.response_timeout,
                });
            }
            tokio::time::sleep(RESPONSE_POLL).await;
        }
        drop(port);

        trace!("{} RX {:02X?}", self.name, received);
        AxisResponse::decode(&cmd, &received)
    }

    /// Exchange a command whose response is a status byte
    async fn send_checked(&self, opcode: u8, payload: impl Into<Vec<u8>>) -> AxisResult<()> {
        let response = self.send_command(opcode, payload).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(AxisError::CommandRejected {
                address: self.address,
                opcode,
            })
        }
    }

    pub async fn read_encoder(&self) -> AxisResult<u16> {
        self.send_command(opcodes::READ_ENCODER, Vec::new())
            .await?
            .value_u16()
    }

    pub async fn read_pulse_count(&self) -> AxisResult<i32> {
        self.send_command(opcodes::READ_PULSE_COUNT, Vec::new())
            .await?
            .value_i32()
    }

    pub async fn read_shaft_angle(&self) -> AxisResult<i32> {
        self.send_command(opcodes::READ_SHAFT_ANGLE, Vec::new())
            .await?
            .value_i32()
    }

    pub async fn is_enabled(&self) -> AxisResult<bool> {
        Ok(self
            .send_command(opcodes::READ_ENABLE, Vec::new())
            .await?
            .is_ok())
    }

    pub async fn set_enabled(&self, enabled: bool) -> AxisResult<()> {
        self.send_checked(opcodes::SET_ENABLE, vec![u8::from(enabled)]).await
    }

    /// Speed in pulses per second
    pub async fn set_speed(&self, pulses_per_sec: u16) -> AxisResult<()> {
        self.send_checked(opcodes::SET_SPEED, pulses_per_sec.to_le_bytes())
            .await
    }

    pub async fn set_direction(&self, direction: Direction) -> AxisResult<()> {
        self.send_checked(opcodes::SET_DIRECTION, vec![direction as u8])
            .await
    }

    /// Make the current position pulse zero
    pub async fn set_zero(&self) -> AxisResult<()> {
        self.send_checked(opcodes::SET_ZERO, vec![0x00]).await
    }

    pub async fn return_to_zero(&self) -> AxisResult<()> {
        self.send_checked(opcodes::RETURN_TO_ZERO, vec![0x00]).await
    }

    pub async fn start(&self) -> AxisResult<()> {
        self.send_checked(opcodes::START, Vec::new()).await
    }

    pub async fn stop(&self) -> AxisResult<()> {
        self.send_checked(opcodes::STOP, Vec::new()).await
    }

    pub async fn move_by_pulses(&self, pulses: i32) -> AxisResult<()> {
        self.send_checked(opcodes::MOVE_BY_PULSES, pulses.to_le_bytes())
            .await
    }

    pub async fn move_to_target(&self, pulses: i32) -> AxisResult<()> {
        self.send_checked(opcodes::MOVE_TO_TARGET, pulses.to_le_bytes())
            .await
    }

    /// Relative move by an angle in axis degrees
    pub async fn move_by_angle(&self, degrees: f64) -> AxisResult<()> {
        self.move_by_pulses(self.geometry.degrees_to_pulses(degrees))
            .await
    }

    /// Current axis angle in degrees from pulse zero
    pub async fn read_degrees(&self) -> AxisResult<f64> {
        Ok(self.geometry.pulses_to_degrees(self.read_pulse_count().await?))
    }

    /// Run continuously at a signed rate in degrees/second; zero stops
    pub async fn run_at_rate(&self, degrees_per_sec: f64) -> AxisResult<()> {
        if degrees_per_sec == 0.0 {
            return self.stop().await;
        }
        let (direction, speed) = self.geometry.rate_to_speed(degrees_per_sec);
        self.set_speed(speed).await?;
        self.set_direction(direction).await?;
        self.start().await
    }

    /// Command a move to an absolute pulse target at `rate` degrees/second
    /// without waiting for it
    pub async fn begin_move_to(&self, target: i32, rate: f64) -> AxisResult<()> {
        let (_, speed) = self.geometry.rate_to_speed(rate);
        debug!("{}: moving to pulse {} at {} pulses/s", self.name, target, speed);
        self.set_speed(speed).await?;
        self.move_to_target(target).await
    }

    /// Command a return to pulse zero at `rate` degrees/second without
    /// waiting for it
    pub async fn begin_return_to_zero(&self, rate: f64) -> AxisResult<()> {
        let (_, speed) = self.geometry.rate_to_speed(rate);
        self.set_speed(speed).await?;
        self.return_to_zero().await
    }

    /// Move to an absolute pulse target at `rate` degrees/second and wait
    /// until the controller reports it there
    pub async fn slew_to_pulses(
        &self,
        target: i32,
        rate: f64,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> AxisResult<WaitOutcome> {
        self.begin_move_to(target, rate).await?;
        self.wait_for_target(target, cancelled).await
    }

    /// Poll the pulse count until it is within tolerance of `target`
    pub async fn wait_for_target(
        &self,
        target: i32,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> AxisResult<WaitOutcome> {
        let tolerance = self.timing.position_tolerance.max(0) as u32;
        let last = AtomicI32::new(0);
        let (this, last_ref) = (self, &last);

        poll_until(
            move || async move {
                let position = this.read_pulse_count().await?;
                last_ref.store(position, Ordering::Relaxed);
                Ok(position.abs_diff(target) <= tolerance)
            },
            cancelled,
            self.timing.move_timeout,
            self.timing.poll_interval,
            |duration| AxisError::MoveTimeout {
                address: self.address,
                target,
                position: last.load(Ordering::Relaxed),
                duration,
            },
        )
        .await
    }

    /// Release the port; other axes sharing it lose it too
    pub async fn close(&self) -> AxisResult<()> {
        self.transport.lock().await.close().await
    }

    /// Run toward the home switch until it closes, then stop
    ///
    /// The axis is stopped on every exit path that reaches the controller,
    /// including timeout and cancellation.
    pub async fn find_home(
        &self,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> AxisResult<WaitOutcome> {
        debug!("{}: searching for home at {} deg/s", self.name, self.timing.home_rate);
        self.run_at_rate(self.timing.home_rate).await?;

        let home = self.home.clone();
        let outcome = poll_until(
            || {
                let homed = home.is_homed();
                async move { Ok(homed) }
            },
            cancelled,
            self.timing.homing_timeout,
            self.timing.poll_interval,
            |_| AxisError::HomingTimeout {
                address: self.address,
                duration: self.timing.homing_timeout,
            },
        )
        .await;

        let stopped = self.stop().await;
        let outcome = outcome?;
        stopped?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{ServoHandle, SimulatedServo};
    use crate::transport::shared;
    use crate::wait::never_cancelled;

    fn fast_geometry() -> AxisGeometry {
        AxisGeometry {
            steps_per_rev: 200,
            microsteps: 16,
            gear_ratio: 1.0,
            reversed: false,
        }
    }

    fn sim_axis(address: u8, home: Option<i32>, timing: AxisTiming) -> (Axis, ServoHandle) {
        let geometry = fast_geometry();
        let servo = SimulatedServo::new(address, geometry.pulses_per_motor_turn(), home);
        let handle = servo.handle();
        let axis = Axis::new(
            "RA",
            address,
            shared(servo),
            geometry,
            timing,
            Arc::new(handle.clone()),
        );
        (axis, handle)
    }

    fn quick_timing() -> AxisTiming {
        AxisTiming {
            poll_interval: Duration::from_millis(5),
            move_timeout: Duration::from_secs(2),
            homing_timeout: Duration::from_millis(500),
            home_rate: 200.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_geometry_conversions() {
        let g = AxisGeometry::default();
        assert!((g.pulses_per_degree() - 1_777.777_777).abs() < 1e-3);
        assert_eq!(g.degrees_to_pulses(1.0), 1_778);
        assert!((g.pulses_to_degrees(g.degrees_to_pulses(45.0)) - 45.0).abs() < 1e-3);

        let reversed = AxisGeometry {
            reversed: true,
            ..g
        };
        assert_eq!(reversed.degrees_to_pulses(1.0), -1_778);
        assert_eq!(reversed.rate_to_speed(1.0).0, Direction::Reverse);
    }

    #[test]
    fn test_sidereal_rate_speed() {
        let g = AxisGeometry::default();
        let (direction, speed) = g.rate_to_speed(15.041 / 3600.0);
        assert_eq!(direction, Direction::Forward);
        assert_eq!(speed, 7);

        let (_, speed) = g.rate_to_speed(1.0e-9);
        assert_eq!(speed, MIN_SPEED);
        let (_, speed) = g.rate_to_speed(1.0e6);
        assert_eq!(speed, u16::MAX);
    }

    #[tokio::test]
    async fn test_read_pulse_count_from_simulator() {
        let (axis, handle) = sim_axis(0xE0, None, quick_timing());
        handle.set_position(256);
        assert_eq!(axis.read_pulse_count().await.unwrap(), 256);
        assert_eq!(handle.commands()[0].encode(), vec![0xE0, 0x33, 0x13]);
    }

    #[tokio::test]
    async fn test_silent_controller_times_out() {
        let (axis, handle) = sim_axis(0xE0, None, quick_timing());
        handle.set_silent(true);
        let err = axis.stop().await.unwrap_err();
        assert!(matches!(
            err,
            AxisError::Timeout {
                address: 0xE0,
                opcode: opcodes::STOP,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let (axis, handle) = sim_axis(0xE1, None, quick_timing());
        handle.reject_opcode(opcodes::SET_ZERO);
        assert_eq!(
            axis.set_zero().await.unwrap_err(),
            AxisError::CommandRejected {
                address: 0xE1,
                opcode: opcodes::SET_ZERO
            }
        );
    }

    #[tokio::test]
    async fn test_slew_to_pulses_reaches_target() {
        let (axis, handle) = sim_axis(0xE0, None, quick_timing());
        let outcome = axis
            .slew_to_pulses(400, 3_000.0, &never_cancelled)
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert!((handle.position() - 400).abs() <= 2);
    }

    #[tokio::test]
    async fn test_slew_cancelled() {
        let (axis, handle) = sim_axis(0xE0, None, quick_timing());
        let outcome = axis
            .slew_to_pulses(1_000_000, 1.0, &|| true)
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_return_to_zero() {
        let (axis, handle) = sim_axis(0xE1, None, quick_timing());
        handle.set_position(-300);
        axis.begin_return_to_zero(3_000.0).await.unwrap();
        let outcome = axis.wait_for_target(0, &never_cancelled).await.unwrap();
        assert!(outcome.is_done());
        assert!(handle.position().abs() <= 2);
        assert_eq!(
            handle.opcodes()[..2],
            [opcodes::SET_SPEED, opcodes::RETURN_TO_ZERO]
        );
    }

    #[tokio::test]
    async fn test_run_at_rate_zero_stops() {
        let (axis, handle) = sim_axis(0xE0, None, quick_timing());
        axis.run_at_rate(-10.0).await.unwrap();
        assert!(handle.is_running());
        axis.run_at_rate(0.0).await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(
            handle.opcodes(),
            vec![
                opcodes::SET_SPEED,
                opcodes::SET_DIRECTION,
                opcodes::START,
                opcodes::STOP
            ]
        );
    }

    #[tokio::test]
    async fn test_find_home_stops_at_switch() {
        let (axis, handle) = sim_axis(0xE0, Some(100), quick_timing());
        let outcome = axis.find_home(&never_cancelled).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert!(!handle.is_running());
        assert!(handle.position() >= 100);
        assert_eq!(handle.opcodes().last(), Some(&opcodes::STOP));
    }

    #[tokio::test]
    async fn test_find_home_times_out() {
        let (axis, handle) = sim_axis(0xE1, None, quick_timing());
        let err = axis.find_home(&never_cancelled).await.unwrap_err();
        assert!(matches!(err, AxisError::HomingTimeout { address: 0xE1, .. }));
        assert!(!handle.is_running());
    }

    #[test]
    fn test_sysfs_home_switch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "1\n").unwrap();
        assert!(SysfsHomeSwitch::new(&path, true).is_homed());
        assert!(!SysfsHomeSwitch::new(&path, false).is_homed());
        assert!(!SysfsHomeSwitch::new(dir.path().join("missing"), true).is_homed());
    }
}
