//! Telescope configuration
//!
//! One TOML file with the sections `[network]`, `[server]`, `[device]`,
//! `[capabilities]`, `[tracking_rates]`, `[axes.ra]`, `[axes.dec]` and
//! `[logging]`. Every key has a default. An optional override file is
//! merged over the base file key by key, so an installation can keep its
//! site-specific settings outside the shipped file.

use crate::axis::{AxisGeometry, AxisTiming};
use crate::error::MountError;
use crate::state::{AlignmentMode, DriveRate, EquatorialSystem, ParkPosition};
use crate::transport::SIMULATOR_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Override file looked for when none is given explicitly
pub const CONTAINER_OVERRIDE_PATH: &str = "/alpyca/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for MountError {
    fn from(err: ConfigError) -> Self {
        MountError::Config(err.to_string())
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip_address: String,
    pub port: u16,
    /// Answer Alpaca discovery broadcasts
    pub discovery: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_address: "0.0.0.0".to_string(),
            port: 11111,
            discovery: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub location: String,
    /// Include panic details in HTTP 500 bodies
    pub verbose_driver_exceptions: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            location: "Unknown".to_string(),
            verbose_driver_exceptions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub description: String,
    pub unique_id: String,
    /// Writing `Connected = true` takes effect immediately instead of
    /// after the settle delay
    pub sync_write_connected: bool,
    pub connect_settle_secs: f64,
    pub alignment_mode: AlignmentMode,
    pub equatorial_system: EquatorialSystem,
    /// Square metres
    pub aperture_area: f64,
    /// Metres
    pub aperture_diameter: f64,
    /// Metres
    pub focal_length: f64,
    pub does_refraction: bool,
    /// Seconds
    pub slew_settle_time: f64,
    /// Degrees, north positive
    pub site_latitude: f64,
    /// Degrees, east positive
    pub site_longitude: f64,
    /// Metres
    pub site_elevation: f64,
    /// Hour angle (hours) and declination (degrees) at pulse zero
    pub park_pos: [f64; 2],
    /// Degrees per second
    pub guide_rate_right_ascension: f64,
    /// Degrees per second
    pub guide_rate_declination: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Starget".to_string(),
            description: "Starget equatorial mount".to_string(),
            unique_id: "7b0b6d2e-5c1a-4d8e-9a53-2f4c1e0a9d61".to_string(),
            sync_write_connected: true,
            connect_settle_secs: 5.0,
            alignment_mode: AlignmentMode::GermanPolar,
            equatorial_system: EquatorialSystem::Topocentric,
            aperture_area: 0.0269,
            aperture_diameter: 0.2,
            focal_length: 1.0,
            does_refraction: false,
            slew_settle_time: 0.0,
            site_latitude: 0.0,
            site_longitude: 0.0,
            site_elevation: 0.0,
            park_pos: [0.0, 90.0],
            guide_rate_right_ascension: 0.5 * 15.041 / 3600.0,
            guide_rate_declination: 0.5 * 15.041 / 3600.0,
        }
    }
}

impl DeviceConfig {
    pub fn park_position(&self) -> ParkPosition {
        ParkPosition {
            hour_angle: self.park_pos[0],
            declination: self.park_pos[1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub can_find_home: bool,
    pub can_park: bool,
    pub can_unpark: bool,
    pub can_set_park: bool,
    #[serde(alias = "can_set_DEC_rate")]
    pub can_set_declination_rate: bool,
    #[serde(alias = "can_set_RA_rate")]
    pub can_set_right_ascension_rate: bool,
    pub can_move_axis: bool,
    pub can_slew: bool,
    pub can_slew_async: bool,
    #[serde(alias = "can_slew_AltAz")]
    pub can_slew_alt_az: bool,
    #[serde(alias = "can_slew_AltAz_async")]
    pub can_slew_alt_az_async: bool,
    pub can_set_tracking: bool,
    pub can_pulse_guide: bool,
    pub can_set_guide_rates: bool,
    pub can_sync: bool,
    #[serde(alias = "can_sync_AltAz")]
    pub can_sync_alt_az: bool,
    pub can_set_pier_side: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_find_home: true,
            can_park: true,
            can_unpark: true,
            can_set_park: true,
            can_set_declination_rate: false,
            can_set_right_ascension_rate: false,
            can_move_axis: true,
            can_slew: true,
            can_slew_async: true,
            can_slew_alt_az: true,
            can_slew_alt_az_async: true,
            can_set_tracking: true,
            can_pulse_guide: true,
            can_set_guide_rates: true,
            can_sync: true,
            can_sync_alt_az: true,
            can_set_pier_side: false,
        }
    }
}

/// Drive rates in arcseconds per SI second
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingRates {
    pub sidereal: f64,
    pub lunar: f64,
    pub solar: f64,
    pub king: f64,
    /// Rates offered through `TrackingRates`
    pub supported: Vec<DriveRate>,
}

impl Default for TrackingRates {
    fn default() -> Self {
        Self {
            sidereal: 15.041,
            lunar: 14.685,
            solar: 15.0,
            king: 15.0369,
            supported: DriveRate::ALL.to_vec(),
        }
    }
}

impl TrackingRates {
    pub fn arcsec_per_sec(&self, rate: DriveRate) -> f64 {
        match rate {
            DriveRate::Sidereal => self.sidereal,
            DriveRate::Lunar => self.lunar,
            DriveRate::Solar => self.solar,
            DriveRate::King => self.king,
        }
    }

    pub fn degrees_per_sec(&self, rate: DriveRate) -> f64 {
        self.arcsec_per_sec(rate) / 3600.0
    }

    pub fn is_supported(&self, rate: DriveRate) -> bool {
        self.supported.contains(&rate)
    }
}

/// One axis controller and its drive train
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    /// Controller bus address; must be set explicitly
    pub address: u8,
    /// Serial device, or `"simulator"`
    pub port: String,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    pub steps_per_rev: u32,
    pub microsteps: u32,
    pub gear_ratio: f64,
    pub reversed: bool,
    /// Degrees per second
    pub slew_rate: f64,
    /// Degrees per second, upper bound for MoveAxis
    pub max_move_rate: f64,
    /// Signed degrees per second for the home search
    pub home_rate: f64,
    pub homing_timeout_secs: f64,
    pub move_timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub position_tolerance_pulses: i32,
    /// sysfs GPIO value file of the home switch
    pub home_switch: Option<PathBuf>,
    pub home_switch_active_high: bool,
    /// Home switch position of the simulated controller, in pulses
    pub sim_home_position: i32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            address: 0,
            port: SIMULATOR_PORT.to_string(),
            baud_rate: 115_200,
            response_timeout_ms: 100,
            steps_per_rev: 200,
            microsteps: 32,
            gear_ratio: 100.0,
            reversed: false,
            slew_rate: 4.0,
            max_move_rate: 4.0,
            home_rate: 1.0,
            homing_timeout_secs: 120.0,
            move_timeout_secs: 300.0,
            poll_interval_ms: 50,
            position_tolerance_pulses: 2,
            home_switch: None,
            home_switch_active_high: true,
            sim_home_position: 0,
        }
    }
}

impl AxisConfig {
    pub fn with_address(address: u8) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.port == SIMULATOR_PORT
    }

    pub fn geometry(&self) -> AxisGeometry {
        AxisGeometry {
            steps_per_rev: self.steps_per_rev,
            microsteps: self.microsteps,
            gear_ratio: self.gear_ratio,
            reversed: self.reversed,
        }
    }

    pub fn timing(&self) -> AxisTiming {
        AxisTiming {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            move_timeout: Duration::from_secs_f64(self.move_timeout_secs.max(0.0)),
            homing_timeout: Duration::from_secs_f64(self.homing_timeout_secs.max(0.0)),
            home_rate: self.home_rate,
            position_tolerance: self.position_tolerance_pulses,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |what: String| Err(ConfigError::Invalid(format!("axes.{}.{}", name, what)));
        if self.address == 0 {
            return invalid("address must be set".to_string());
        }
        if self.steps_per_rev == 0 || self.microsteps == 0 || self.gear_ratio <= 0.0 {
            return invalid("gearing must be positive".to_string());
        }
        if self.slew_rate <= 0.0 || self.max_move_rate < 0.0 {
            return invalid(format!(
                "rates must be positive (slew_rate {}, max_move_rate {})",
                self.slew_rate, self.max_move_rate
            ));
        }
        if !(self.homing_timeout_secs.is_finite() && self.homing_timeout_secs >= 0.0)
            || !(self.move_timeout_secs.is_finite() && self.move_timeout_secs >= 0.0)
        {
            return invalid(format!(
                "timeouts must be finite and not negative (homing_timeout_secs {}, move_timeout_secs {})",
                self.homing_timeout_secs, self.move_timeout_secs
            ));
        }
        if self.home_rate == 0.0 {
            return invalid("home_rate must be non-zero".to_string());
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AxesConfig {
    pub ra: AxisConfig,
    pub dec: AxisConfig,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            ra: AxisConfig::with_address(0xE0),
            dec: AxisConfig::with_address(0xE1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `starget_mount=debug`
    pub log_level: String,
    pub log_to_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_stdout: true,
        }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub capabilities: Capabilities,
    pub tracking_rates: TrackingRates,
    pub axes: AxesConfig,
    pub logging: LoggingConfig,
}

impl TelescopeConfig {
    /// Load and validate a single file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_override(path, None)
    }

    /// Load `base`, merge `override_path` over it if that file exists,
    /// then validate
    pub fn load_with_override(base: &Path, override_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = read_table(base)?;
        info!("Loaded configuration from {}", base.display());

        if let Some(over) = override_path.filter(|p| p.exists()) {
            merge_tables(&mut merged, read_table(over)?);
            info!("Applied configuration overrides from {}", over.display());
        }

        let config = toml::Value::Table(merged)
            .try_into::<TelescopeConfig>()
            .map_err(|e| ConfigError::Parse {
                path: base.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: TelescopeConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.device;
        if !(-90.0..=90.0).contains(&d.site_latitude) {
            return Err(ConfigError::Invalid(format!(
                "device.site_latitude {} outside [-90, 90]",
                d.site_latitude
            )));
        }
        if !(-180.0..=180.0).contains(&d.site_longitude) {
            return Err(ConfigError::Invalid(format!(
                "device.site_longitude {} outside [-180, 180]",
                d.site_longitude
            )));
        }
        let settle_ok = |secs: f64| secs.is_finite() && secs >= 0.0;
        if !settle_ok(d.connect_settle_secs) || !settle_ok(d.slew_settle_time) {
            return Err(ConfigError::Invalid(
                "device settle times must be finite and not negative".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&d.park_pos[1]) {
            return Err(ConfigError::Invalid(format!(
                "device.park_pos declination {} outside [-90, 90]",
                d.park_pos[1]
            )));
        }

        self.axes.ra.validate("ra")?;
        self.axes.dec.validate("dec")?;
        if self.axes.ra.port == self.axes.dec.port
            && !self.axes.ra.is_simulated()
            && self.axes.ra.address == self.axes.dec.address
        {
            return Err(ConfigError::Invalid(format!(
                "axes.ra and axes.dec share port {} and address 0x{:02X}",
                self.axes.ra.port, self.axes.ra.address
            )));
        }

        if self.tracking_rates.supported.is_empty() {
            return Err(ConfigError::Invalid(
                "tracking_rates.supported must list at least one rate".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    text.parse::<toml::Table>().map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Recursively overlay `over` onto `base`; tables merge, values replace
fn merge_tables(base: &mut toml::Table, over: toml::Table) {
    for (key, value) in over {
        let incoming = match value {
            toml::Value::Table(incoming) => incoming,
            other => {
                base.insert(key, other);
                continue;
            }
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, toml::Value::Table(incoming));
    }
}

/// Rewrite `device.park_pos` in the file at `path`, leaving every other
/// key untouched. A missing file is created.
pub fn save_park_position(path: &Path, park: ParkPosition) -> Result<(), ConfigError> {
    let mut table = if path.exists() {
        read_table(path)?
    } else {
        toml::Table::new()
    };

    let device = table
        .entry("device")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(device) = device else {
        return Err(ConfigError::Invalid(format!(
            "[device] in {} is not a table",
            path.display()
        )));
    };
    device.insert(
        "park_pos".to_string(),
        toml::Value::Array(vec![
            toml::Value::Float(park.hour_angle),
            toml::Value::Float(park.declination),
        ]),
    );

    let text = toml::to_string_pretty(&table).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    std::fs::write(path, text).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(
        "Saved park position ({:.4}h, {:.4}deg) to {}",
        park.hour_angle,
        park.declination,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TelescopeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.port, 11111);
        assert_eq!(config.axes.ra.address, 0xE0);
        assert_eq!(config.axes.dec.address, 0xE1);
        assert!(config.device.sync_write_connected);
        assert_eq!(config.tracking_rates.arcsec_per_sec(DriveRate::Lunar), 14.685);
    }

    #[test]
    fn test_partial_file() {
        let config = TelescopeConfig::from_toml_str(
            r#"
            [device]
            site_latitude = 48.85
            site_longitude = 2.35
            alignment_mode = "polar"

            [capabilities]
            can_slew_AltAz = false
            "#,
        )
        .unwrap();
        assert_eq!(config.device.site_latitude, 48.85);
        assert_eq!(config.device.alignment_mode, AlignmentMode::Polar);
        assert!(!config.capabilities.can_slew_alt_az);
        assert!(config.capabilities.can_slew);
        assert_eq!(config.network.port, 11111);
    }

    #[test]
    fn test_partial_axis_table_needs_address() {
        let err = TelescopeConfig::from_toml_str(
            r#"
            [axes.dec]
            port = "/dev/ttyUSB1"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("axes.dec.address"));
    }

    #[test]
    fn test_rejects_out_of_range_site() {
        let err = TelescopeConfig::from_toml_str("[device]\nsite_latitude = 91.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("site_latitude")));
    }

    #[test]
    fn test_rejects_non_finite_durations() {
        let err = TelescopeConfig::from_toml_str("[device]\nconnect_settle_secs = nan\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("settle")));

        let text = "[axes.ra]\naddress = 0xE0\nhoming_timeout_secs = inf\n";
        let err = TelescopeConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("axes.ra")));

        let text = "[axes.dec]\naddress = 0xE1\nmove_timeout_secs = -inf\n";
        let err = TelescopeConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("axes.dec")));
    }

    #[test]
    fn test_rejects_shared_address_on_one_port() {
        let err = TelescopeConfig::from_toml_str(
            r#"
            [axes.ra]
            address = 224
            port = "/dev/serial0"
            [axes.dec]
            address = 224
            port = "/dev/serial0"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("share port"));
    }

    #[test]
    fn test_override_merges_key_by_key() {
        let base = write_temp(
            r#"
            [network]
            port = 11111
            [device]
            site_latitude = 10.0
            site_longitude = 20.0
            "#,
        );
        let over = write_temp(
            r#"
            [device]
            site_longitude = -70.5
            "#,
        );

        let config = TelescopeConfig::load_with_override(base.path(), Some(over.path())).unwrap();
        assert_eq!(config.device.site_latitude, 10.0);
        assert_eq!(config.device.site_longitude, -70.5);
        assert_eq!(config.network.port, 11111);
    }

    #[test]
    fn test_missing_override_is_ignored() {
        let base = write_temp("[network]\nport = 4567\n");
        let config = TelescopeConfig::load_with_override(
            base.path(),
            Some(Path::new("/nonexistent/starget-override.toml")),
        )
        .unwrap();
        assert_eq!(config.network.port, 4567);
    }

    #[test]
    fn test_missing_base_is_read_error() {
        let err = TelescopeConfig::load(Path::new("/nonexistent/starget.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        let mount: MountError = err.into();
        assert_eq!(mount.error_number(), 0x501);
    }

    #[test]
    fn test_save_park_position_preserves_other_keys() {
        let file = write_temp(
            r#"
            [network]
            port = 2222
            [device]
            site_latitude = 45.0
            park_pos = [0.0, 90.0]
            "#,
        );
        save_park_position(
            file.path(),
            ParkPosition {
                hour_angle: -1.5,
                declination: 30.0,
            },
        )
        .unwrap();

        let config = TelescopeConfig::load(file.path()).unwrap();
        assert_eq!(config.device.park_pos, [-1.5, 30.0]);
        assert_eq!(config.device.site_latitude, 45.0);
        assert_eq!(config.network.port, 2222);
    }

    #[test]
    fn test_axis_timing_conversion() {
        let axis = AxisConfig {
            response_timeout_ms: 250,
            homing_timeout_secs: 1.5,
            ..AxisConfig::with_address(0xE0)
        };
        let timing = axis.timing();
        assert_eq!(timing.response_timeout, Duration::from_millis(250));
        assert_eq!(timing.homing_timeout, Duration::from_millis(1500));
        assert!((axis.geometry().pulses_per_degree() - 1_777.78).abs() < 0.01);
    }
}
