//! Mount state model
//!
//! [`MountState`] holds everything the device reports. It is only ever
//! touched through [`SharedState`], whose closures run under one lock, so
//! every read or mutation is atomic and no lock can be left held on an
//! error path. Setters log the field and its new value at debug level.

use crate::coords::{normalize_hours, SiteLocation};
use crate::error::MountError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

// =============================================================================
// ENUMS
// =============================================================================

/// Pier side matching ASCOM PierSide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PierSide {
    East = 0,
    West = 1,
    Unknown = -1,
}

impl PierSide {
    /// Side the tube sits on for a pointing at `hour_angle` hours:
    /// on or west of the meridian is East, east of it is West
    pub fn from_hour_angle(hour_angle: f64) -> Self {
        if hour_angle >= 0.0 {
            PierSide::East
        } else {
            PierSide::West
        }
    }
}

impl TryFrom<i32> for PierSide {
    type Error = MountError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PierSide::East),
            1 => Ok(PierSide::West),
            -1 => Ok(PierSide::Unknown),
            _ => Err(MountError::invalid_value(format!("SideOfPier {}", value))),
        }
    }
}

impl std::fmt::Display for PierSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PierSide::East => write!(f, "East"),
            PierSide::West => write!(f, "West"),
            PierSide::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Tracking rate matching ASCOM DriveRates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveRate {
    Sidereal = 0,
    Lunar = 1,
    Solar = 2,
    King = 3,
}

impl DriveRate {
    pub const ALL: [DriveRate; 4] = [
        DriveRate::Sidereal,
        DriveRate::Lunar,
        DriveRate::Solar,
        DriveRate::King,
    ];
}

impl TryFrom<i32> for DriveRate {
    type Error = MountError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DriveRate::Sidereal),
            1 => Ok(DriveRate::Lunar),
            2 => Ok(DriveRate::Solar),
            3 => Ok(DriveRate::King),
            _ => Err(MountError::invalid_value(format!("TrackingRate {}", value))),
        }
    }
}

impl std::fmt::Display for DriveRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveRate::Sidereal => write!(f, "Sidereal"),
            DriveRate::Lunar => write!(f, "Lunar"),
            DriveRate::Solar => write!(f, "Solar"),
            DriveRate::King => write!(f, "King"),
        }
    }
}

/// Alignment mode matching ASCOM AlignmentModes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    AltAz = 0,
    Polar = 1,
    GermanPolar = 2,
}

/// Equatorial coordinate system matching ASCOM EquatorialCoordinateType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquatorialSystem {
    Other = 0,
    Topocentric = 1,
    J2000 = 2,
    J2050 = 3,
    B1950 = 4,
}

/// Mount axis matching ASCOM TelescopeAxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelescopeAxis {
    Primary = 0,
    Secondary = 1,
    Tertiary = 2,
}

impl TryFrom<i32> for TelescopeAxis {
    type Error = MountError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TelescopeAxis::Primary),
            1 => Ok(TelescopeAxis::Secondary),
            2 => Ok(TelescopeAxis::Tertiary),
            _ => Err(MountError::invalid_value(format!("Axis {}", value))),
        }
    }
}

impl std::fmt::Display for TelescopeAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelescopeAxis::Primary => write!(f, "primary"),
            TelescopeAxis::Secondary => write!(f, "secondary"),
            TelescopeAxis::Tertiary => write!(f, "tertiary"),
        }
    }
}

/// Pulse guide direction matching ASCOM GuideDirections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideDirection {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
}

impl GuideDirection {
    /// Sign of the coordinate change: North raises DEC, East raises RA
    pub fn sign(self) -> f64 {
        match self {
            GuideDirection::North | GuideDirection::East => 1.0,
            GuideDirection::South | GuideDirection::West => -1.0,
        }
    }

    pub fn is_declination(self) -> bool {
        matches!(self, GuideDirection::North | GuideDirection::South)
    }
}

impl TryFrom<i32> for GuideDirection {
    type Error = MountError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GuideDirection::North),
            1 => Ok(GuideDirection::South),
            2 => Ok(GuideDirection::East),
            3 => Ok(GuideDirection::West),
            _ => Err(MountError::invalid_value(format!("Direction {}", value))),
        }
    }
}

/// What kind of motion is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    Slewing,
    Parking,
    Homing,
    MovingAxis,
}

impl MotionKind {
    /// Whether tracking resumes when this motion ends normally
    pub fn resumes_tracking(self) -> bool {
        matches!(self, MotionKind::Slewing | MotionKind::MovingAxis)
    }
}

impl std::fmt::Display for MotionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MotionKind::Slewing => write!(f, "slewing"),
            MotionKind::Parking => write!(f, "parking"),
            MotionKind::Homing => write!(f, "homing"),
            MotionKind::MovingAxis => write!(f, "moving axis"),
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Mount-referential pointing at pulse zero of both axes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParkPosition {
    /// Hours
    pub hour_angle: f64,
    /// Degrees
    pub declination: f64,
}

impl Default for ParkPosition {
    fn default() -> Self {
        Self {
            hour_angle: 0.0,
            declination: 90.0,
        }
    }
}

/// Connection lifecycle, kept apart from [`MountState`] so status reads
/// never wait behind a connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    /// Bumped by every connect or disconnect so a late settle timer
    /// cannot resurrect an abandoned attempt
    pub attempt: u64,
}

macro_rules! traced_setters {
    ($($setter:ident => $field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $setter(&mut self, value: $ty) {
                debug!(field = stringify!($field), value = ?value, "mount state");
                self.$field = value;
            }
        )*
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountState {
    /// Hours, [0, 24)
    pub right_ascension: f64,
    /// Degrees, [-90, 90]
    pub declination: f64,
    pub target_right_ascension: Option<f64>,
    pub target_declination: Option<f64>,
    pub tracking: bool,
    pub tracking_rate: DriveRate,
    pub motion: Option<MotionKind>,
    /// Tracking state to restore when the current motion ends normally
    pub resume_tracking: bool,
    /// MoveAxis rates in degrees/second, primary then secondary
    pub axis_rates: [f64; 2],
    pub at_home: bool,
    pub at_park: bool,
    pub pulse_guiding: bool,
    pub side_of_pier: PierSide,
    pub site: SiteLocation,
    /// Seconds of RA per sidereal second
    pub right_ascension_rate: f64,
    /// Arcseconds per SI second
    pub declination_rate: f64,
    /// Degrees per second
    pub guide_rate_right_ascension: f64,
    /// Degrees per second
    pub guide_rate_declination: f64,
    /// Seconds
    pub slew_settle_time: f64,
    pub park: ParkPosition,
    /// Bumped by every abort; tasks from an older epoch must not write
    pub motion_epoch: u64,
}

impl Default for MountState {
    fn default() -> Self {
        Self {
            right_ascension: 0.0,
            declination: 90.0,
            target_right_ascension: None,
            target_declination: None,
            tracking: false,
            tracking_rate: DriveRate::Sidereal,
            motion: None,
            resume_tracking: false,
            axis_rates: [0.0; 2],
            at_home: false,
            at_park: false,
            pulse_guiding: false,
            side_of_pier: PierSide::Unknown,
            site: SiteLocation::default(),
            right_ascension_rate: 0.0,
            declination_rate: 0.0,
            guide_rate_right_ascension: 0.0,
            guide_rate_declination: 0.0,
            slew_settle_time: 0.0,
            park: ParkPosition::default(),
            motion_epoch: 0,
        }
    }
}

impl MountState {
    traced_setters! {
        set_tracking => tracking: bool,
        set_tracking_rate => tracking_rate: DriveRate,
        set_at_home => at_home: bool,
        set_at_park => at_park: bool,
        set_pulse_guiding => pulse_guiding: bool,
        set_side_of_pier => side_of_pier: PierSide,
        set_site => site: SiteLocation,
        set_right_ascension_rate => right_ascension_rate: f64,
        set_declination_rate => declination_rate: f64,
        set_guide_rate_right_ascension => guide_rate_right_ascension: f64,
        set_guide_rate_declination => guide_rate_declination: f64,
        set_slew_settle_time => slew_settle_time: f64,
        set_park => park: ParkPosition,
    }

    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    pub fn is_slewing(&self) -> bool {
        self.motion.is_some()
    }

    /// Set the pointing, normalizing RA to [0, 24) and clamping DEC
    pub fn set_position(&mut self, right_ascension: f64, declination: f64) {
        self.right_ascension = normalize_hours(right_ascension);
        self.declination = declination.clamp(-90.0, 90.0);
        debug!(
            ra = self.right_ascension,
            dec = self.declination,
            "mount state position"
        );
    }

    pub fn set_target_right_ascension(&mut self, value: f64) {
        debug!(field = "target_right_ascension", value, "mount state");
        self.target_right_ascension = Some(value);
    }

    pub fn set_target_declination(&mut self, value: f64) {
        debug!(field = "target_declination", value, "mount state");
        self.target_declination = Some(value);
    }

    pub fn set_target(&mut self, right_ascension: f64, declination: f64) {
        self.set_target_right_ascension(right_ascension);
        self.set_target_declination(declination);
    }

    /// Target if both halves have been written
    pub fn target(&self) -> Option<(f64, f64)> {
        Some((self.target_right_ascension?, self.target_declination?))
    }

    pub fn set_axis_rate(&mut self, index: usize, rate: f64) {
        debug!(field = "axis_rates", index, value = rate, "mount state");
        self.axis_rates[index] = rate;
    }

    /// Enter a moving state and return the epoch the motion belongs to
    ///
    /// Clears the reference-position flags and suspends tracking, which is
    /// remembered for slews and axis moves.
    pub fn begin_motion(&mut self, kind: MotionKind) -> u64 {
        debug!(field = "motion", value = %kind, "mount state");
        self.resume_tracking = self.tracking && kind.resumes_tracking();
        self.motion = Some(kind);
        self.at_home = false;
        self.at_park = false;
        self.tracking = false;
        self.motion_epoch
    }

    /// Whether a task submitted in `epoch` may still write state
    pub fn is_current(&self, epoch: u64) -> bool {
        self.motion_epoch == epoch
    }

    /// Leave the moving state normally if `epoch` is still current,
    /// switching tracking back on when the motion suspended it. Returns
    /// whether the tracking drive has to be restarted.
    pub fn end_motion(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        debug!(field = "motion", value = "idle", "mount state");
        self.motion = None;
        self.axis_rates = [0.0; 2];
        let resume = std::mem::take(&mut self.resume_tracking);
        if resume {
            self.set_tracking(true);
        }
        resume
    }

    /// Leave the moving state after a failure: no terminal flag, no
    /// tracking
    pub fn abandon_motion(&mut self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        debug!(field = "motion", value = "idle (abandoned)", "mount state");
        self.motion = None;
        self.axis_rates = [0.0; 2];
        self.resume_tracking = false;
    }

    /// Invalidate every in-flight task and drop to idle. Returns the new
    /// epoch.
    pub fn abort(&mut self) -> u64 {
        self.motion_epoch = self.motion_epoch.wrapping_add(1);
        debug!(field = "motion_epoch", value = self.motion_epoch, "mount state abort");
        self.motion = None;
        self.resume_tracking = false;
        self.pulse_guiding = false;
        self.axis_rates = [0.0; 2];
        self.motion_epoch
    }
}

/// The single lock around [`MountState`]
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<MountState>>,
}

impl SharedState {
    pub fn new(state: MountState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Read under the lock
    pub fn with<R>(&self, f: impl FnOnce(&MountState) -> R) -> R {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Mutate under the lock
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut MountState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn snapshot(&self) -> MountState {
        self.with(MountState::clone)
    }
}
