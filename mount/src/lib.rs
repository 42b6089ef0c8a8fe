//! German equatorial mount driver
//!
//! Drives a two-axis mount whose RA and DEC axes are servo controllers on
//! a serial bus, and presents it as an ASCOM-style telescope device.
//!
//! ## Layers
//!
//! - [`protocol`]: command/response frames of the axis controllers
//! - [`transport`], [`simulator`]: byte streams to real or simulated axes
//! - [`axis`]: one controller, with degree/pulse geometry and motion waits
//! - [`coords`]: sidereal time and equatorial/horizontal transforms
//! - [`state`], [`guard`], [`executor`]: mount state, motion ownership and
//!   the single motion worker
//! - [`telescope`]: the device facade everything else talks to

pub mod axis;
pub mod config;
pub mod coords;
pub mod error;
pub mod executor;
pub mod guard;
mod motion;
pub mod protocol;
pub mod simulator;
pub mod state;
pub mod telescope;
pub mod transport;
pub mod wait;

pub use axis::{Axis, AxisGeometry, AxisTiming, HomeSensor, NoHomeSwitch, SysfsHomeSwitch};
pub use config::{
    AxesConfig, AxisConfig, Capabilities, ConfigError, TelescopeConfig, CONTAINER_OVERRIDE_PATH,
};
pub use coords::{Clock, FixedClock, SiteLocation, SystemClock};
pub use error::{AxisError, AxisResult, MountError, MountResult};
pub use executor::{MotionExecutor, MotionTask};
pub use state::{
    AlignmentMode, DriveRate, EquatorialSystem, GuideDirection, PierSide, TelescopeAxis,
};
pub use telescope::{MountAxes, RateRange, Telescope, TelescopeStatus};

/// Driver version reported to clients
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
