//! Coordinate transforms between the equatorial and horizontal frames
//!
//! Sidereal time is Greenwich mean sidereal time from the IAU 1982
//! polynomial plus the site longitude. No precession, nutation or
//! refraction is applied, so positions are "mean of date" at best.
//!
//! Conventions: right ascension and sidereal time in hours, everything
//! else in degrees, azimuth measured from north through east, longitude
//! positive east. At the celestial poles and at the zenith the azimuth
//! (resp. right ascension) is undefined; the functions still return a
//! finite number there but it carries no meaning.

use chrono::{DateTime, Utc};

/// Julian date of the Unix epoch
const JD_UNIX_EPOCH: f64 = 2_440_587.5;
/// Julian date of J2000.0
const JD_J2000: f64 = 2_451_545.0;
const MICROS_PER_DAY: f64 = 86_400_000_000.0;

// =============================================================================
// CLOCK
// =============================================================================

/// Source of the current time, injectable so transforms are testable
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Observing site
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SiteLocation {
    /// Degrees, north positive
    pub latitude: f64,
    /// Degrees, east positive
    pub longitude: f64,
    /// Metres above mean sea level
    pub elevation: f64,
}

impl SiteLocation {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equatorial {
    /// Hours, [0, 24)
    pub right_ascension: f64,
    /// Degrees, [-90, 90]
    pub declination: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizontal {
    /// Degrees, [-90, 90]
    pub altitude: f64,
    /// Degrees, [0, 360)
    pub azimuth: f64,
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Wrap hours into [0, 24)
pub fn normalize_hours(hours: f64) -> f64 {
    let h = hours.rem_euclid(24.0);
    // rem_euclid can round up to exactly 24.0 for tiny negative inputs
    if h >= 24.0 {
        0.0
    } else {
        h
    }
}

/// Wrap degrees into [0, 360)
pub fn normalize_degrees(degrees: f64) -> f64 {
    let d = degrees.rem_euclid(360.0);
    if d >= 360.0 {
        0.0
    } else {
        d
    }
}

/// Wrap degrees into [-180, 180)
pub fn normalize_degrees_signed(degrees: f64) -> f64 {
    normalize_degrees(degrees + 180.0) - 180.0
}

/// Wrap an hour angle into [-12, 12)
pub fn normalize_hour_angle(hours: f64) -> f64 {
    normalize_hours(hours + 12.0) - 12.0
}

// =============================================================================
// SIDEREAL TIME
// =============================================================================

pub fn julian_date(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / MICROS_PER_DAY + JD_UNIX_EPOCH
}

/// Greenwich mean sidereal time in hours, [0, 24)
pub fn greenwich_sidereal_time(time: DateTime<Utc>) -> f64 {
    let d = julian_date(time) - JD_J2000;
    let t = d / 36_525.0;
    let degrees = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    normalize_hours(normalize_degrees(degrees) / 15.0)
}

/// Local mean sidereal time in hours for a longitude (degrees, east positive)
pub fn local_sidereal_time(time: DateTime<Utc>, longitude: f64) -> f64 {
    normalize_hours(greenwich_sidereal_time(time) + longitude / 15.0)
}

/// Local sidereal time at a site right now
pub fn local_sidereal_time_now(clock: &dyn Clock, site: &SiteLocation) -> f64 {
    local_sidereal_time(clock.now(), site.longitude)
}

/// Hour angle in hours, [-12, 12); positive west of the meridian
pub fn hour_angle(right_ascension: f64, lst: f64) -> f64 {
    normalize_hour_angle(lst - right_ascension)
}

// =============================================================================
// FRAME TRANSFORMS
// =============================================================================

/// Equatorial (RA hours, DEC degrees) to horizontal (Alt, Az degrees)
pub fn equatorial_to_horizontal(
    right_ascension: f64,
    declination: f64,
    site: &SiteLocation,
    time: DateTime<Utc>,
) -> Horizontal {
    let lst = local_sidereal_time(time, site.longitude);
    let ha = (hour_angle(right_ascension, lst) * 15.0).to_radians();
    let dec = declination.to_radians();
    let lat = site.latitude.to_radians();

    let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
    let altitude = sin_alt.clamp(-1.0, 1.0).asin().to_degrees();

    let y = -dec.cos() * ha.sin();
    let x = dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos();
    let azimuth = normalize_degrees(y.atan2(x).to_degrees());

    Horizontal { altitude, azimuth }
}

/// Horizontal (Alt, Az degrees) to equatorial (RA hours, DEC degrees)
pub fn horizontal_to_equatorial(
    altitude: f64,
    azimuth: f64,
    site: &SiteLocation,
    time: DateTime<Utc>,
) -> Equatorial {
    let alt = altitude.to_radians();
    let az = azimuth.to_radians();
    let lat = site.latitude.to_radians();

    let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
    let declination = sin_dec.clamp(-1.0, 1.0).asin().to_degrees();

    let y = -az.sin() * alt.cos();
    let x = alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos();
    let ha_hours = y.atan2(x).to_degrees() / 15.0;

    let lst = local_sidereal_time(time, site.longitude);
    Equatorial {
        right_ascension: normalize_hours(lst - ha_hours),
        declination,
    }
}
