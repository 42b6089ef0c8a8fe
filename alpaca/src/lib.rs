//! Alpaca Protocol Server
//!
//! Publishes a [`starget_mount::Telescope`] through the ASCOM Alpaca REST
//! API, with the management endpoints and the UDP discovery responder.

mod discovery;
mod envelope;
mod error;
mod management;
mod params;
mod server;
mod telescope;

pub use discovery::{probe, DiscoveryResponder, DiscoveryResponse, DISCOVERY_MESSAGE};
pub use envelope::{AlpacaResponse, DeviceReply};
pub use error::AlpacaError;
pub use management::{ConfiguredDevice, ServerDescription};
pub use params::Params;
pub use server::{router, serve};

/// Alpaca API version
pub const ALPACA_API_VERSION: u32 = 1;

/// Default Alpaca discovery port
pub const ALPACA_DISCOVERY_PORT: u16 = 32227;

/// Default Alpaca API port
pub const ALPACA_DEFAULT_PORT: u16 = 11111;

/// The only device this server publishes
pub const DEVICE_NUMBER: u32 = 0;

/// ITelescope interface version
pub const INTERFACE_VERSION: i32 = 4;
