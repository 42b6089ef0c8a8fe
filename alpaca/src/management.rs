//! Alpaca management API

use crate::envelope::AlpacaResponse;
use crate::params::Params;
use crate::{ALPACA_API_VERSION, DEVICE_NUMBER};
use serde::Serialize;
use serde_json::json;
use starget_mount::{Telescope, DRIVER_VERSION};

const MANUFACTURER: &str = "Starget";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerDescription {
    pub server_name: String,
    pub manufacturer: String,
    pub manufacturer_version: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfiguredDevice {
    pub device_name: String,
    pub device_type: String,
    pub device_number: u32,
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
}

pub fn api_versions(params: &Params) -> AlpacaResponse {
    AlpacaResponse::ok(Some(json!([ALPACA_API_VERSION])), params)
}

pub fn description(telescope: &Telescope, params: &Params) -> AlpacaResponse {
    let config = telescope.config();
    let description = ServerDescription {
        server_name: config.device.name.clone(),
        manufacturer: MANUFACTURER.to_string(),
        manufacturer_version: DRIVER_VERSION.to_string(),
        location: config.server.location.clone(),
    };
    AlpacaResponse::ok(Some(json!(description)), params)
}

pub fn configured_devices(telescope: &Telescope, params: &Params) -> AlpacaResponse {
    let device = &telescope.config().device;
    let devices = [ConfiguredDevice {
        device_name: device.name.clone(),
        device_type: "Telescope".to_string(),
        device_number: DEVICE_NUMBER,
        unique_id: device.unique_id.clone(),
    }];
    AlpacaResponse::ok(Some(json!(devices)), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_device_field_names() {
        let device = ConfiguredDevice {
            device_name: "Starget".to_string(),
            device_type: "Telescope".to_string(),
            device_number: 0,
            unique_id: "abc".to_string(),
        };
        let body = serde_json::to_value(device).unwrap();
        assert_eq!(body["DeviceName"], json!("Starget"));
        assert_eq!(body["DeviceType"], json!("Telescope"));
        assert_eq!(body["DeviceNumber"], json!(0));
        assert_eq!(body["UniqueID"], json!("abc"));
    }

    #[test]
    fn test_api_versions() {
        let response = api_versions(&Params::default());
        assert_eq!(response.value, Some(json!([1])));
        assert_eq!(response.error_number, 0);
    }
}
