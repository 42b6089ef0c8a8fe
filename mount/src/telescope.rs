//! Telescope device facade
//!
//! The single entry point for everything the Alpaca layer does. Reads are
//! answered from [`MountState`] without touching the hardware. Commands
//! are validated synchronously in a fixed order (capability, argument
//! range, connection, parked, moving), the state transition is applied
//! under the state lock, and any hardware work is handed to the motion
//! executor so the call returns before the motion finishes.

use crate::axis::{Axis, HomeSensor, NoHomeSwitch, SysfsHomeSwitch};
use crate::config::{AxesConfig, AxisConfig, Capabilities, TelescopeConfig};
use crate::coords::{
    equatorial_to_horizontal, hour_angle, horizontal_to_equatorial, local_sidereal_time,
    normalize_hour_angle, Clock, Horizontal, SiteLocation, SystemClock,
};
use crate::error::{MountError, MountResult};
use crate::executor::{MotionExecutor, MotionTask};
use crate::guard::{GuardScope, MotionGuard};
use crate::motion::MotionContext;
use crate::simulator::{ServoHandle, SimulatedServo};
use crate::state::{
    ConnectionState, DriveRate, GuideDirection, MotionKind, MountState, ParkPosition, PierSide,
    SharedState, TelescopeAxis,
};
use crate::transport::{shared, PortRegistry};
use crate::wait::{never_cancelled, poll_until};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// AXES
// =============================================================================

/// The two axis controllers of the mount
#[derive(Debug, Clone)]
pub struct MountAxes {
    pub ra: Arc<Axis>,
    pub dec: Arc<Axis>,
}

impl MountAxes {
    pub fn new(ra: Axis, dec: Axis) -> Self {
        Self {
            ra: Arc::new(ra),
            dec: Arc::new(dec),
        }
    }

    /// Open both axes; axes on the same port share one transport
    pub fn open(config: &AxesConfig) -> MountResult<Self> {
        let mut ports = PortRegistry::new();
        let ra = open_axis("RA", &config.ra, &mut ports)?;
        let dec = open_axis("DEC", &config.dec, &mut ports)?;
        Ok(Self::new(ra, dec))
    }

    /// Both axes on simulators, with handles for inspecting them
    pub fn simulated(config: &AxesConfig) -> (Self, ServoHandle, ServoHandle) {
        let (ra, ra_handle) = simulated_axis("RA", &config.ra);
        let (dec, dec_handle) = simulated_axis("DEC", &config.dec);
        (Self::new(ra, dec), ra_handle, dec_handle)
    }

    pub async fn close(&self) {
        for axis in [&self.ra, &self.dec] {
            if let Err(e) = axis.close().await {
                warn!("Failed to close {} axis port: {}", axis.name(), e);
            }
        }
    }
}

fn open_axis(name: &str, config: &AxisConfig, ports: &mut PortRegistry) -> MountResult<Axis> {
    if config.is_simulated() {
        info!("{} axis 0x{:02X} on the simulator", name, config.address);
        return Ok(simulated_axis(name, config).0);
    }

    let transport = ports.open_serial(&config.port, config.baud_rate)?;
    let home: Arc<dyn HomeSensor> = match &config.home_switch {
        Some(path) => Arc::new(SysfsHomeSwitch::new(path, config.home_switch_active_high)),
        None => Arc::new(NoHomeSwitch),
    };
    info!(
        "{} axis 0x{:02X} on {} at {} baud",
        name, config.address, config.port, config.baud_rate
    );
    Ok(Axis::new(
        name,
        config.address,
        transport,
        config.geometry(),
        config.timing(),
        home,
    ))
}

fn simulated_axis(name: &str, config: &AxisConfig) -> (Axis, ServoHandle) {
    let geometry = config.geometry();
    let servo = SimulatedServo::new(
        config.address,
        geometry.pulses_per_motor_turn(),
        Some(config.sim_home_position),
    );
    let handle = servo.handle();
    let axis = Axis::new(
        name,
        config.address,
        shared(servo),
        geometry,
        config.timing(),
        Arc::new(handle.clone()),
    );
    (axis, handle)
}

// =============================================================================
// STATUS
// =============================================================================

/// Supported MoveAxis rate interval in degrees/second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRange {
    pub minimum: f64,
    pub maximum: f64,
}

/// One-shot summary for logs and the status endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct TelescopeStatus {
    pub connected: bool,
    pub right_ascension: f64,
    pub declination: f64,
    pub tracking: bool,
    pub slewing: bool,
    pub at_home: bool,
    pub at_park: bool,
    pub pulse_guiding: bool,
    pub side_of_pier: PierSide,
}

// =============================================================================
// VALIDATION
// =============================================================================

fn check_right_ascension(ra: f64) -> MountResult<()> {
    if (0.0..24.0).contains(&ra) {
        Ok(())
    } else {
        Err(MountError::invalid_value(format!("RightAscension {} outside [0, 24)", ra)))
    }
}

fn check_declination(dec: f64) -> MountResult<()> {
    if (-90.0..=90.0).contains(&dec) {
        Ok(())
    } else {
        Err(MountError::invalid_value(format!("Declination {} outside [-90, 90]", dec)))
    }
}

fn check_alt_az(altitude: f64, azimuth: f64) -> MountResult<()> {
    if !(-90.0..=90.0).contains(&altitude) {
        return Err(MountError::invalid_value(format!("Altitude {} outside [-90, 90]", altitude)));
    }
    if !(0.0..360.0).contains(&azimuth) {
        return Err(MountError::invalid_value(format!("Azimuth {} outside [0, 360)", azimuth)));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: f64) -> MountResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(MountError::invalid_value(format!("{} {} must not be negative", name, value)))
    }
}

fn check_finite(name: &str, value: f64) -> MountResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MountError::invalid_value(format!("{} {}", name, value)))
    }
}

fn require(capable: bool, what: &str) -> MountResult<()> {
    if capable {
        Ok(())
    } else {
        Err(MountError::not_implemented(what))
    }
}

fn ensure_unparked(s: &MountState, what: &str) -> MountResult<()> {
    if s.at_park {
        Err(MountError::InvalidWhileParked(what.to_string()))
    } else {
        Ok(())
    }
}

fn ensure_still(s: &MountState, what: &str) -> MountResult<()> {
    match s.motion {
        Some(kind) => Err(MountError::invalid_operation(format!(
            "{} while the mount is {}",
            what, kind
        ))),
        None => Ok(()),
    }
}

// =============================================================================
// TELESCOPE
// =============================================================================

pub struct Telescope {
    config: Arc<TelescopeConfig>,
    ctx: MotionContext,
    connection: Arc<Mutex<ConnectionState>>,
    executor: MotionExecutor,
    runtime: tokio::runtime::Handle,
}

impl Telescope {
    /// Build the device and start its motion worker on the current tokio
    /// runtime. The mount starts unparked, pointing at the park position.
    pub fn new(config: TelescopeConfig, axes: MountAxes, clock: Arc<dyn Clock>) -> Self {
        let device = &config.device;
        let park = device.park_position();
        let site = SiteLocation::new(device.site_latitude, device.site_longitude, device.site_elevation);
        let lst = local_sidereal_time(clock.now(), site.longitude);

        let mut state = MountState {
            site,
            park,
            slew_settle_time: device.slew_settle_time,
            guide_rate_right_ascension: device.guide_rate_right_ascension,
            guide_rate_declination: device.guide_rate_declination,
            ..Default::default()
        };
        state.set_position(lst - park.hour_angle, park.declination);
        state.set_side_of_pier(PierSide::from_hour_angle(park.hour_angle));

        let config = Arc::new(config);
        Self {
            ctx: MotionContext {
                state: SharedState::new(state),
                axes,
                clock,
                config: config.clone(),
                config_path: None,
            },
            config,
            connection: Arc::new(Mutex::new(ConnectionState::default())),
            executor: MotionExecutor::start(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Open the configured axes and use the system clock
    pub fn from_config(config: TelescopeConfig) -> MountResult<Self> {
        let axes = MountAxes::open(&config.axes)?;
        Ok(Self::new(config, axes, Arc::new(SystemClock)))
    }

    /// File that SetPark writes the new park position to
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ctx.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &TelescopeConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.config.capabilities
    }

    fn caps(&self) -> &Capabilities {
        &self.config.capabilities
    }

    fn read<R>(&self, f: impl FnOnce(&MountState) -> R) -> R {
        self.ctx.state.with(f)
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a state transition that requires a connection. The connection
    /// lock is held throughout so a disconnect cannot slip in between the
    /// check and the transition.
    fn transition<R>(&self, f: impl FnOnce(&mut MountState) -> MountResult<R>) -> MountResult<R> {
        let connection = self.lock_connection();
        if !connection.connected {
            return Err(MountError::NotConnected);
        }
        self.ctx.state.with_mut(f)
    }

    fn launch(
        &self,
        name: &str,
        future: impl Future<Output = MountResult<()>> + Send + 'static,
    ) -> MountResult<()> {
        self.executor.submit(MotionTask::new(name, future))
    }

    /// Enter `kind` and queue the task built from its guard
    fn launch_motion<F, Fut>(&self, name: &str, kind: MotionKind, epoch: u64, build: F) -> MountResult<()>
    where
        F: FnOnce(MotionContext, MotionGuard) -> Fut,
        Fut: Future<Output = MountResult<()>> + Send + 'static,
    {
        let guard = MotionGuard::new(self.ctx.state.clone(), epoch, GuardScope::Motion(kind));
        self.launch(name, build(self.ctx.clone(), guard))
    }

    fn lst(&self) -> f64 {
        let longitude = self.read(|s| s.site.longitude);
        local_sidereal_time(self.ctx.clock.now(), longitude)
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    pub fn connected(&self) -> bool {
        self.lock_connection().connected
    }

    pub fn connecting(&self) -> bool {
        self.lock_connection().connecting
    }

    /// Alpaca `Connected` write
    pub fn set_connected(&self, connected: bool) -> MountResult<()> {
        match (connected, self.config.device.sync_write_connected) {
            (true, true) => self.connect_now(),
            (true, false) => self.connect(),
            (false, _) => self.disconnect(),
        }
    }

    fn connect_now(&self) -> MountResult<()> {
        let mut connection = self.lock_connection();
        if !connection.connected {
            connection.attempt += 1;
            connection.connecting = false;
            connection.connected = true;
            info!("Connected");
        }
        Ok(())
    }

    /// Start connecting; `connected` turns true after the settle time
    pub fn connect(&self) -> MountResult<()> {
        let mut connection = self.lock_connection();
        if connection.connected || connection.connecting {
            return Ok(());
        }
        connection.attempt += 1;
        connection.connecting = true;
        let attempt = connection.attempt;
        drop(connection);

        let settle = Duration::from_secs_f64(self.config.device.connect_settle_secs);
        info!("Connecting, settling for {:.1}s", settle.as_secs_f64());
        let shared = self.connection.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(settle).await;
            let mut connection = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if connection.connecting && connection.attempt == attempt {
                connection.connecting = false;
                connection.connected = true;
                info!("Connected");
            } else {
                debug!("Connect attempt {} abandoned", attempt);
            }
        });
        Ok(())
    }

    /// Refused while anything is moving; stops tracking
    pub fn disconnect(&self) -> MountResult<()> {
        let mut connection = self.lock_connection();
        if !connection.connected && !connection.connecting {
            return Ok(());
        }
        let stop_tracking = self.ctx.state.with_mut(|s| {
            if let Some(kind) = s.motion {
                return Err(MountError::invalid_operation(format!(
                    "cannot disconnect while the mount is {}",
                    kind
                )));
            }
            if s.pulse_guiding {
                return Err(MountError::invalid_operation(
                    "cannot disconnect while pulse guiding",
                ));
            }
            let was_tracking = s.tracking;
            s.set_tracking(false);
            Ok(was_tracking.then_some(s.motion_epoch))
        })?;
        connection.attempt += 1;
        connection.connected = false;
        connection.connecting = false;
        drop(connection);

        if let Some(epoch) = stop_tracking {
            if let Err(e) = self.launch("stop tracking", self.ctx.clone().track(epoch, false)) {
                warn!("Tracking drive left running: {}", e);
            }
        }
        info!("Disconnected");
        Ok(())
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    pub fn right_ascension(&self) -> f64 {
        self.read(|s| s.right_ascension)
    }

    pub fn declination(&self) -> f64 {
        self.read(|s| s.declination)
    }

    fn horizontal(&self) -> Horizontal {
        let (ra, dec, site) = self.read(|s| (s.right_ascension, s.declination, s.site));
        equatorial_to_horizontal(ra, dec, &site, self.ctx.clock.now())
    }

    pub fn altitude(&self) -> f64 {
        self.horizontal().altitude
    }

    pub fn azimuth(&self) -> f64 {
        self.horizontal().azimuth
    }

    /// Local mean sidereal time in hours
    pub fn sidereal_time(&self) -> f64 {
        self.lst()
    }

    pub fn utc_date(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    pub fn is_slewing(&self) -> bool {
        self.read(|s| s.is_slewing())
    }

    pub fn is_moving(&self) -> bool {
        self.read(|s| s.is_moving())
    }

    pub fn at_home(&self) -> bool {
        self.read(|s| s.at_home)
    }

    pub fn at_park(&self) -> bool {
        self.read(|s| s.at_park)
    }

    pub fn is_pulse_guiding(&self) -> bool {
        self.read(|s| s.pulse_guiding)
    }

    pub fn side_of_pier(&self) -> PierSide {
        self.read(|s| s.side_of_pier)
    }

    pub fn status(&self) -> TelescopeStatus {
        let connected = self.connected();
        self.read(|s| TelescopeStatus {
            connected,
            right_ascension: s.right_ascension,
            declination: s.declination,
            tracking: s.tracking,
            slewing: s.is_slewing(),
            at_home: s.at_home,
            at_park: s.at_park,
            pulse_guiding: s.pulse_guiding,
            side_of_pier: s.side_of_pier,
        })
    }

    /// Pier side a slew to `ra`/`dec` would end on
    pub fn destination_side_of_pier(&self, ra: f64, dec: f64) -> MountResult<PierSide> {
        check_right_ascension(ra)?;
        check_declination(dec)?;
        Ok(PierSide::from_hour_angle(hour_angle(ra, self.lst())))
    }

    pub fn can_move_axis(&self, axis: TelescopeAxis) -> bool {
        self.caps().can_move_axis && axis != TelescopeAxis::Tertiary
    }

    pub fn axis_rates(&self, axis: TelescopeAxis) -> Vec<RateRange> {
        let maximum = match axis {
            _ if !self.can_move_axis(axis) => return Vec::new(),
            TelescopeAxis::Primary => self.config.axes.ra.max_move_rate,
            _ => self.config.axes.dec.max_move_rate,
        };
        vec![RateRange {
            minimum: 0.0,
            maximum,
        }]
    }

    /// Poll until nothing is moving
    pub async fn wait_until_stopped(&self, poll: Duration, timeout: Duration) -> MountResult<()> {
        poll_until(
            || {
                let moving = self.is_moving();
                async move { Ok(!moving) }
            },
            &never_cancelled,
            timeout,
            poll,
            |elapsed| MountError::Timeout(format!("mount still moving after {:.1}s", elapsed.as_secs_f64())),
        )
        .await
        .map(|_| ())
    }

    /// Upper bound for a slew including its settle time
    pub fn motion_timeout(&self) -> Duration {
        let axes = &self.config.axes;
        let moves = Duration::from_secs_f64(axes.ra.move_timeout_secs.max(axes.dec.move_timeout_secs).max(0.0));
        moves + Duration::from_secs_f64(self.read(|s| s.slew_settle_time))
    }

    // =========================================================================
    // SLEWING
    // =========================================================================

    fn begin_slew(&self, ra: f64, dec: f64, what: &str) -> MountResult<()> {
        let epoch = self.transition(|s| {
            ensure_unparked(s, what)?;
            ensure_still(s, what)?;
            s.set_target(ra, dec);
            Ok(s.begin_motion(MotionKind::Slewing))
        })?;
        self.launch_motion(what, MotionKind::Slewing, epoch, move |ctx, guard| {
            ctx.slew(guard, ra, dec)
        })
    }

    pub fn slew_to_coordinates(&self, ra: f64, dec: f64) -> MountResult<()> {
        require(self.caps().can_slew, "SlewToCoordinates")?;
        check_right_ascension(ra)?;
        check_declination(dec)?;
        self.begin_slew(ra, dec, "SlewToCoordinates")
    }

    pub fn slew_to_coordinates_async(&self, ra: f64, dec: f64) -> MountResult<()> {
        require(self.caps().can_slew_async, "SlewToCoordinatesAsync")?;
        check_right_ascension(ra)?;
        check_declination(dec)?;
        self.begin_slew(ra, dec, "SlewToCoordinatesAsync")
    }

    fn stored_target(&self, what: &str) -> MountResult<(f64, f64)> {
        self.read(|s| s.target())
            .ok_or_else(|| MountError::ValueNotSet(format!("{} target", what)))
    }

    pub fn slew_to_target(&self) -> MountResult<()> {
        require(self.caps().can_slew, "SlewToTarget")?;
        let (ra, dec) = self.stored_target("SlewToTarget")?;
        self.begin_slew(ra, dec, "SlewToTarget")
    }

    pub fn slew_to_target_async(&self) -> MountResult<()> {
        require(self.caps().can_slew_async, "SlewToTargetAsync")?;
        let (ra, dec) = self.stored_target("SlewToTargetAsync")?;
        self.begin_slew(ra, dec, "SlewToTargetAsync")
    }

    fn alt_az_to_equatorial(&self, altitude: f64, azimuth: f64) -> (f64, f64) {
        let site = self.read(|s| s.site);
        let eq = horizontal_to_equatorial(altitude, azimuth, &site, self.ctx.clock.now());
        (eq.right_ascension, eq.declination)
    }

    pub fn slew_to_alt_az(&self, altitude: f64, azimuth: f64) -> MountResult<()> {
        require(self.caps().can_slew_alt_az, "SlewToAltAz")?;
        check_alt_az(altitude, azimuth)?;
        let (ra, dec) = self.alt_az_to_equatorial(altitude, azimuth);
        self.begin_slew(ra, dec, "SlewToAltAz")
    }

    pub fn slew_to_alt_az_async(&self, altitude: f64, azimuth: f64) -> MountResult<()> {
        require(self.caps().can_slew_alt_az_async, "SlewToAltAzAsync")?;
        check_alt_az(altitude, azimuth)?;
        let (ra, dec) = self.alt_az_to_equatorial(altitude, azimuth);
        self.begin_slew(ra, dec, "SlewToAltAzAsync")
    }

    /// Stop whatever is moving. Returns once the state is idle; the stop
    /// commands follow on the motion worker.
    pub fn abort_slew(&self) -> MountResult<()> {
        let epoch = self.transition(|s| {
            ensure_unparked(s, "AbortSlew")?;
            if let Some(kind) = s.motion {
                warn!("Aborting while {}", kind);
            }
            Ok(s.abort())
        })?;
        self.launch("abort slew", self.ctx.clone().abort(epoch))
    }

    // =========================================================================
    // SYNC
    // =========================================================================

    /// Declare the current pointing to be `ra`/`dec`. Only the reference
    /// is shifted; no axis command is sent.
    fn sync(&self, ra: f64, dec: f64, what: &str) -> MountResult<()> {
        let lst = self.lst();
        self.transition(|s| {
            ensure_unparked(s, what)?;
            ensure_still(s, what)?;
            let park = ParkPosition {
                hour_angle: normalize_hour_angle(s.park.hour_angle + (s.right_ascension - ra)),
                declination: s.park.declination + (dec - s.declination),
            };
            s.set_park(park);
            s.set_target(ra, dec);
            s.set_position(ra, dec);
            s.set_side_of_pier(PierSide::from_hour_angle(hour_angle(ra, lst)));
            Ok(())
        })?;
        info!("Synced to RA {:.4}h DEC {:+.4}°", ra, dec);
        Ok(())
    }

    pub fn sync_to_coordinates(&self, ra: f64, dec: f64) -> MountResult<()> {
        require(self.caps().can_sync, "SyncToCoordinates")?;
        check_right_ascension(ra)?;
        check_declination(dec)?;
        self.sync(ra, dec, "SyncToCoordinates")
    }

    pub fn sync_to_target(&self) -> MountResult<()> {
        require(self.caps().can_sync, "SyncToTarget")?;
        let (ra, dec) = self.stored_target("SyncToTarget")?;
        self.sync(ra, dec, "SyncToTarget")
    }

    pub fn sync_to_alt_az(&self, altitude: f64, azimuth: f64) -> MountResult<()> {
        require(self.caps().can_sync_alt_az, "SyncToAltAz")?;
        check_alt_az(altitude, azimuth)?;
        let (ra, dec) = self.alt_az_to_equatorial(altitude, azimuth);
        self.sync(ra, dec, "SyncToAltAz")
    }

    // =========================================================================
    // PARK / HOME
    // =========================================================================

    /// Park; a no-op when already parked
    pub fn park(&self) -> MountResult<()> {
        require(self.caps().can_park, "Park")?;
        let epoch = self.transition(|s| {
            if s.at_park {
                return Ok(None);
            }
            ensure_still(s, "Park")?;
            Ok(Some(s.begin_motion(MotionKind::Parking)))
        })?;
        match epoch {
            Some(epoch) => self.launch_motion("park", MotionKind::Parking, epoch, |ctx, guard| ctx.park(guard)),
            None => {
                debug!("Park ignored, already parked");
                Ok(())
            }
        }
    }

    pub fn unpark(&self) -> MountResult<()> {
        require(self.caps().can_unpark, "Unpark")?;
        self.transition(|s| {
            if s.at_park {
                s.set_at_park(false);
                info!("Unparked");
            }
            Ok(())
        })
    }

    /// Make the current pointing the park position
    pub fn set_park(&self) -> MountResult<()> {
        require(self.caps().can_set_park, "SetPark")?;
        let epoch = self.transition(|s| {
            ensure_unparked(s, "SetPark")?;
            ensure_still(s, "SetPark")?;
            Ok(s.motion_epoch)
        })?;
        self.launch("set park", self.ctx.clone().set_park(epoch))
    }

    pub fn find_home(&self) -> MountResult<()> {
        require(self.caps().can_find_home, "FindHome")?;
        let epoch = self.transition(|s| {
            ensure_unparked(s, "FindHome")?;
            ensure_still(s, "FindHome")?;
            Ok(s.begin_motion(MotionKind::Homing))
        })?;
        self.launch_motion("find home", MotionKind::Homing, epoch, |ctx, guard| ctx.find_home(guard))
    }

    // =========================================================================
    // MOVE AXIS / PULSE GUIDE
    // =========================================================================

    /// Run one axis at a fixed rate; zero stops it. Rates may be changed
    /// while the mount is already moving its axes.
    pub fn move_axis(&self, axis: TelescopeAxis, rate: f64) -> MountResult<()> {
        require(self.caps().can_move_axis, "MoveAxis")?;
        let index = match axis {
            TelescopeAxis::Primary => 0,
            TelescopeAxis::Secondary => 1,
            TelescopeAxis::Tertiary => return Err(MountError::not_implemented("MoveAxis(tertiary)")),
        };
        let maximum = self.axis_rates(axis).first().map_or(0.0, |r| r.maximum);
        if !rate.is_finite() || rate.abs() > maximum {
            return Err(MountError::invalid_value(format!(
                "MoveAxis rate {} outside [-{}, {}]",
                rate, maximum, maximum
            )));
        }

        let (epoch, moving) = self.transition(|s| {
            ensure_unparked(s, "MoveAxis")?;
            match s.motion {
                Some(MotionKind::MovingAxis) => {}
                Some(kind) => {
                    return Err(MountError::invalid_operation(format!(
                        "MoveAxis while the mount is {}",
                        kind
                    )))
                }
                None if rate == 0.0 => {}
                None => {
                    let epoch = s.begin_motion(MotionKind::MovingAxis);
                    s.set_axis_rate(index, rate);
                    return Ok((epoch, true));
                }
            }
            s.set_axis_rate(index, rate);
            Ok((s.motion_epoch, s.motion.is_some()))
        })?;

        // every task of a MoveAxis motion holds a guard, so whichever
        // call fails takes the mount out of the moving state
        let guard = moving.then(|| {
            MotionGuard::new(
                self.ctx.state.clone(),
                epoch,
                GuardScope::Motion(MotionKind::MovingAxis),
            )
        });
        self.launch(
            &format!("move {} axis", axis),
            self.ctx.clone().move_axis(guard, epoch, axis, rate),
        )
    }

    pub fn pulse_guide(&self, direction: GuideDirection, duration_ms: i64) -> MountResult<()> {
        require(self.caps().can_pulse_guide, "PulseGuide")?;
        let duration = u64::try_from(duration_ms)
            .map(Duration::from_millis)
            .map_err(|_| MountError::invalid_value(format!("PulseGuide duration {}", duration_ms)))?;

        let epoch = self.transition(|s| {
            ensure_unparked(s, "PulseGuide")?;
            ensure_still(s, "PulseGuide")?;
            if s.pulse_guiding {
                return Err(MountError::invalid_operation("PulseGuide while already guiding"));
            }
            s.set_pulse_guiding(true);
            Ok(s.motion_epoch)
        })?;
        let guard = MotionGuard::new(self.ctx.state.clone(), epoch, GuardScope::PulseGuide);
        self.launch("pulse guide", self.ctx.clone().pulse_guide(guard, direction, duration))
    }

    // =========================================================================
    // TRACKING
    // =========================================================================

    pub fn tracking(&self) -> bool {
        self.read(|s| s.tracking)
    }

    pub fn set_tracking(&self, enabled: bool) -> MountResult<()> {
        require(self.caps().can_set_tracking, "Tracking")?;
        let epoch = self.transition(|s| {
            if enabled {
                ensure_unparked(s, "Tracking")?;
            }
            ensure_still(s, "Tracking")?;
            s.set_tracking(enabled);
            Ok(s.motion_epoch)
        })?;
        let name = if enabled { "start tracking" } else { "stop tracking" };
        self.launch(name, self.ctx.clone().track(epoch, enabled))
    }

    pub fn tracking_rate(&self) -> DriveRate {
        self.read(|s| s.tracking_rate)
    }

    pub fn set_tracking_rate(&self, rate: DriveRate) -> MountResult<()> {
        if !self.config.tracking_rates.is_supported(rate) {
            return Err(MountError::invalid_value(format!("TrackingRate {} not supported", rate)));
        }
        let restart = self.transition(|s| {
            s.set_tracking_rate(rate);
            Ok((s.tracking && !s.is_moving()).then_some(s.motion_epoch))
        })?;
        match restart {
            Some(epoch) => self.launch("change tracking rate", self.ctx.clone().track(epoch, true)),
            None => Ok(()),
        }
    }

    pub fn tracking_rates(&self) -> &[DriveRate] {
        &self.config.tracking_rates.supported
    }

    pub fn right_ascension_rate(&self) -> f64 {
        self.read(|s| s.right_ascension_rate)
    }

    pub fn set_right_ascension_rate(&self, rate: f64) -> MountResult<()> {
        require(self.caps().can_set_right_ascension_rate, "RightAscensionRate")?;
        check_finite("RightAscensionRate", rate)?;
        self.transition(|s| {
            s.set_right_ascension_rate(rate);
            Ok(())
        })
    }

    pub fn declination_rate(&self) -> f64 {
        self.read(|s| s.declination_rate)
    }

    pub fn set_declination_rate(&self, rate: f64) -> MountResult<()> {
        require(self.caps().can_set_declination_rate, "DeclinationRate")?;
        check_finite("DeclinationRate", rate)?;
        self.transition(|s| {
            s.set_declination_rate(rate);
            Ok(())
        })
    }

    pub fn guide_rate_right_ascension(&self) -> f64 {
        self.read(|s| s.guide_rate_right_ascension)
    }

    pub fn set_guide_rate_right_ascension(&self, rate: f64) -> MountResult<()> {
        require(self.caps().can_set_guide_rates, "GuideRateRightAscension")?;
        check_non_negative("GuideRateRightAscension", rate)?;
        self.transition(|s| {
            s.set_guide_rate_right_ascension(rate);
            Ok(())
        })
    }

    pub fn guide_rate_declination(&self) -> f64 {
        self.read(|s| s.guide_rate_declination)
    }

    pub fn set_guide_rate_declination(&self, rate: f64) -> MountResult<()> {
        require(self.caps().can_set_guide_rates, "GuideRateDeclination")?;
        check_non_negative("GuideRateDeclination", rate)?;
        self.transition(|s| {
            s.set_guide_rate_declination(rate);
            Ok(())
        })
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    pub fn set_side_of_pier(&self, side: PierSide) -> MountResult<()> {
        require(self.caps().can_set_pier_side, "SideOfPier")?;
        if side == PierSide::Unknown {
            return Err(MountError::invalid_value("SideOfPier Unknown"));
        }
        self.transition(|s| {
            ensure_unparked(s, "SideOfPier")?;
            ensure_still(s, "SideOfPier")?;
            s.set_side_of_pier(side);
            Ok(())
        })
    }

    pub fn site(&self) -> SiteLocation {
        self.read(|s| s.site)
    }

    pub fn set_site_latitude(&self, latitude: f64) -> MountResult<()> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(MountError::invalid_value(format!("SiteLatitude {} outside [-90, 90]", latitude)));
        }
        self.transition(|s| {
            s.set_site(SiteLocation { latitude, ..s.site });
            Ok(())
        })
    }

    pub fn set_site_longitude(&self, longitude: f64) -> MountResult<()> {
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(MountError::invalid_value(format!(
                "SiteLongitude {} outside [-180, 180]",
                longitude
            )));
        }
        self.transition(|s| {
            s.set_site(SiteLocation { longitude, ..s.site });
            Ok(())
        })
    }

    pub fn set_site_elevation(&self, elevation: f64) -> MountResult<()> {
        if !(-300.0..=10_000.0).contains(&elevation) {
            return Err(MountError::invalid_value(format!(
                "SiteElevation {} outside [-300, 10000]",
                elevation
            )));
        }
        self.transition(|s| {
            s.set_site(SiteLocation { elevation, ..s.site });
            Ok(())
        })
    }

    pub fn slew_settle_time(&self) -> f64 {
        self.read(|s| s.slew_settle_time)
    }

    pub fn set_slew_settle_time(&self, seconds: f64) -> MountResult<()> {
        check_non_negative("SlewSettleTime", seconds)?;
        self.transition(|s| {
            s.set_slew_settle_time(seconds);
            Ok(())
        })
    }

    pub fn target_right_ascension(&self) -> MountResult<f64> {
        self.read(|s| s.target_right_ascension)
            .ok_or_else(|| MountError::ValueNotSet("TargetRightAscension".to_string()))
    }

    pub fn set_target_right_ascension(&self, ra: f64) -> MountResult<()> {
        check_right_ascension(ra)?;
        self.transition(|s| {
            s.set_target_right_ascension(ra);
            Ok(())
        })
    }

    pub fn target_declination(&self) -> MountResult<f64> {
        self.read(|s| s.target_declination)
            .ok_or_else(|| MountError::ValueNotSet("TargetDeclination".to_string()))
    }

    pub fn set_target_declination(&self, dec: f64) -> MountResult<()> {
        check_declination(dec)?;
        self.transition(|s| {
            s.set_target_declination(dec);
            Ok(())
        })
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Let the motion in flight finish, discard queued work, release the
    /// ports
    pub async fn shutdown(&self, timeout: Duration) -> MountResult<()> {
        info!("Shutting down telescope");
        let stopped = self.executor.stop(timeout).await;
        self.ctx.axes.close().await;
        stopped
    }

    #[cfg(test)]
    fn shared_state(&self) -> SharedState {
        self.ctx.state.clone()
    }
}
