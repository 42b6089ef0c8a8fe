//! Alpaca Telescope API
//!
//! Maps `/api/v1/telescope/0/{operation}` onto the device facade. Request
//! problems (unknown operation, missing or unparseable parameter) come
//! back as [`AlpacaError`]; everything the telescope itself rejects is a
//! [`DeviceReply`] error and travels in the envelope.

use crate::envelope::DeviceReply;
use crate::error::AlpacaError;
use crate::params::Params;
use crate::INTERFACE_VERSION;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{json, Value};
use starget_mount::{
    DriveRate, GuideDirection, MountError, MountResult, PierSide, Telescope, TelescopeAxis,
    DRIVER_VERSION,
};
use std::time::Duration;

const DRIVER_INFO: &str = "Starget German equatorial mount driver";

/// Poll interval while a synchronous slew runs
const SLEW_POLL: Duration = Duration::from_millis(100);

fn value<T: Serialize>(value: T) -> DeviceReply {
    Ok(Some(json!(value)))
}

fn done(result: MountResult<()>) -> DeviceReply {
    result.map(|_| None)
}

/// Run a synchronous slew to completion
async fn wait_for_motion(telescope: &Telescope, started: MountResult<()>) -> DeviceReply {
    started?;
    telescope
        .wait_until_stopped(SLEW_POLL, telescope.motion_timeout())
        .await?;
    Ok(None)
}

fn axis_param(params: &Params) -> Result<MountResult<TelescopeAxis>, AlpacaError> {
    Ok(TelescopeAxis::try_from(params.parse::<i32>("Axis")?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AxisRate {
    minimum: f64,
    maximum: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StateValue {
    name: &'static str,
    value: Value,
}

/// Operational state snapshot for `devicestate`
fn device_state(telescope: &Telescope) -> Vec<StateValue> {
    let status = telescope.status();
    let now = telescope.utc_date().to_rfc3339_opts(SecondsFormat::Millis, true);
    let entry = |name: &'static str, value: Value| StateValue { name, value };
    vec![
        entry("Altitude", json!(telescope.altitude())),
        entry("AtHome", json!(status.at_home)),
        entry("AtPark", json!(status.at_park)),
        entry("Azimuth", json!(telescope.azimuth())),
        entry("Declination", json!(status.declination)),
        entry("IsPulseGuiding", json!(status.pulse_guiding)),
        entry("RightAscension", json!(status.right_ascension)),
        entry("SideOfPier", json!(status.side_of_pier as i32)),
        entry("SiderealTime", json!(telescope.sidereal_time())),
        entry("Slewing", json!(status.slewing)),
        entry("Tracking", json!(status.tracking)),
        entry("UTCDate", json!(now)),
        entry("TimeStamp", json!(now)),
    ]
}

/// Handle a GET. Properties never touch the hardware.
pub fn get(telescope: &Telescope, operation: &str, params: &Params) -> Result<DeviceReply, AlpacaError> {
    let device = &telescope.config().device;
    let caps = telescope.capabilities();

    let reply = match operation {
        "connected" => value(telescope.connected()),
        "connecting" => value(telescope.connecting()),
        "description" => value(&device.description),
        "devicestate" => value(device_state(telescope)),
        "driverinfo" => value(DRIVER_INFO),
        "driverversion" => value(DRIVER_VERSION),
        "interfaceversion" => value(INTERFACE_VERSION),
        "name" => value(&device.name),
        "supportedactions" => value(Vec::<String>::new()),

        "alignmentmode" => value(device.alignment_mode as i32),
        "altitude" => value(telescope.altitude()),
        "aperturearea" => value(device.aperture_area),
        "aperturediameter" => value(device.aperture_diameter),
        "athome" => value(telescope.at_home()),
        "atpark" => value(telescope.at_park()),
        "azimuth" => value(telescope.azimuth()),
        "canfindhome" => value(caps.can_find_home),
        "canpark" => value(caps.can_park),
        "canpulseguide" => value(caps.can_pulse_guide),
        "cansetdeclinationrate" => value(caps.can_set_declination_rate),
        "cansetguiderates" => value(caps.can_set_guide_rates),
        "cansetpark" => value(caps.can_set_park),
        "cansetpierside" => value(caps.can_set_pier_side),
        "cansetrightascensionrate" => value(caps.can_set_right_ascension_rate),
        "cansettracking" => value(caps.can_set_tracking),
        "canslew" => value(caps.can_slew),
        "canslewaltaz" => value(caps.can_slew_alt_az),
        "canslewaltazasync" => value(caps.can_slew_alt_az_async),
        "canslewasync" => value(caps.can_slew_async),
        "cansync" => value(caps.can_sync),
        "cansyncaltaz" => value(caps.can_sync_alt_az),
        "canunpark" => value(caps.can_unpark),
        "declination" => value(telescope.declination()),
        "declinationrate" => value(telescope.declination_rate()),
        "doesrefraction" => value(device.does_refraction),
        "equatorialsystem" => value(device.equatorial_system as i32),
        "focallength" => value(device.focal_length),
        "guideratedeclination" => value(telescope.guide_rate_declination()),
        "guideraterightascension" => value(telescope.guide_rate_right_ascension()),
        "ispulseguiding" => value(telescope.is_pulse_guiding()),
        "rightascension" => value(telescope.right_ascension()),
        "rightascensionrate" => value(telescope.right_ascension_rate()),
        "sideofpier" => value(telescope.side_of_pier() as i32),
        "siderealtime" => value(telescope.sidereal_time()),
        "siteelevation" => value(telescope.site().elevation),
        "sitelatitude" => value(telescope.site().latitude),
        "sitelongitude" => value(telescope.site().longitude),
        "slewing" => value(telescope.is_slewing()),
        "slewsettletime" => value(telescope.slew_settle_time()),
        "targetdeclination" => telescope.target_declination().and_then(value),
        "targetrightascension" => telescope.target_right_ascension().and_then(value),
        "tracking" => value(telescope.tracking()),
        "trackingrate" => value(telescope.tracking_rate() as i32),
        "trackingrates" => value(
            telescope
                .tracking_rates()
                .iter()
                .map(|rate| *rate as i32)
                .collect::<Vec<_>>(),
        ),
        "utcdate" => value(
            telescope
                .utc_date()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),

        "axisrates" => axis_param(params)?.and_then(|axis| {
            value(
                telescope
                    .axis_rates(axis)
                    .into_iter()
                    .map(|r| AxisRate {
                        minimum: r.minimum,
                        maximum: r.maximum,
                    })
                    .collect::<Vec<_>>(),
            )
        }),
        "canmoveaxis" => axis_param(params)?.and_then(|axis| value(telescope.can_move_axis(axis))),
        "destinationsideofpier" => {
            let ra = params.parse("RightAscension")?;
            let dec = params.parse("Declination")?;
            telescope
                .destination_side_of_pier(ra, dec)
                .and_then(|side| value(side as i32))
        }

        _ => return Err(AlpacaError::unknown_operation("GET", operation)),
    };
    Ok(reply)
}

/// Handle a PUT. Motion methods return as soon as the motion is queued,
/// except the synchronous slews, which wait for the mount to stop.
pub async fn put(telescope: &Telescope, operation: &str, params: &Params) -> Result<DeviceReply, AlpacaError> {
    let reply = match operation {
        "connected" => done(telescope.set_connected(params.boolean("Connected")?)),
        "connect" => done(telescope.connect()),
        "disconnect" => done(telescope.disconnect()),
        "action" | "commandblind" | "commandbool" | "commandstring" => {
            Err(MountError::not_implemented(operation))
        }

        "abortslew" => done(telescope.abort_slew()),
        "findhome" => done(telescope.find_home()),
        "park" => done(telescope.park()),
        "setpark" => done(telescope.set_park()),
        "unpark" => done(telescope.unpark()),

        "slewtocoordinates" => {
            let (ra, dec) = (params.parse("RightAscension")?, params.parse("Declination")?);
            wait_for_motion(telescope, telescope.slew_to_coordinates(ra, dec)).await
        }
        "slewtocoordinatesasync" => {
            let (ra, dec) = (params.parse("RightAscension")?, params.parse("Declination")?);
            done(telescope.slew_to_coordinates_async(ra, dec))
        }
        "slewtotarget" => wait_for_motion(telescope, telescope.slew_to_target()).await,
        "slewtotargetasync" => done(telescope.slew_to_target_async()),
        "slewtoaltaz" => {
            let (az, alt) = (params.parse("Azimuth")?, params.parse("Altitude")?);
            wait_for_motion(telescope, telescope.slew_to_alt_az(alt, az)).await
        }
        "slewtoaltazasync" => {
            let (az, alt) = (params.parse("Azimuth")?, params.parse("Altitude")?);
            done(telescope.slew_to_alt_az_async(alt, az))
        }

        "synctocoordinates" => {
            let (ra, dec) = (params.parse("RightAscension")?, params.parse("Declination")?);
            done(telescope.sync_to_coordinates(ra, dec))
        }
        "synctotarget" => done(telescope.sync_to_target()),
        "synctoaltaz" => {
            let (az, alt) = (params.parse("Azimuth")?, params.parse("Altitude")?);
            done(telescope.sync_to_alt_az(alt, az))
        }

        "moveaxis" => {
            let axis = axis_param(params)?;
            let rate = params.parse("Rate")?;
            done(axis.and_then(|axis| telescope.move_axis(axis, rate)))
        }
        "pulseguide" => {
            let direction = GuideDirection::try_from(params.parse::<i32>("Direction")?);
            let duration = params.parse("Duration")?;
            done(direction.and_then(|d| telescope.pulse_guide(d, duration)))
        }

        "tracking" => done(telescope.set_tracking(params.boolean("Tracking")?)),
        "trackingrate" => {
            let rate = DriveRate::try_from(params.parse::<i32>("TrackingRate")?);
            done(rate.and_then(|r| telescope.set_tracking_rate(r)))
        }
        "rightascensionrate" => {
            done(telescope.set_right_ascension_rate(params.parse("RightAscensionRate")?))
        }
        "declinationrate" => done(telescope.set_declination_rate(params.parse("DeclinationRate")?)),
        "guideraterightascension" => done(
            telescope.set_guide_rate_right_ascension(params.parse("GuideRateRightAscension")?),
        ),
        "guideratedeclination" => {
            done(telescope.set_guide_rate_declination(params.parse("GuideRateDeclination")?))
        }
        "sideofpier" => {
            let side = PierSide::try_from(params.parse::<i32>("SideOfPier")?);
            done(side.and_then(|s| telescope.set_side_of_pier(s)))
        }

        "siteelevation" => done(telescope.set_site_elevation(params.parse("SiteElevation")?)),
        "sitelatitude" => done(telescope.set_site_latitude(params.parse("SiteLatitude")?)),
        "sitelongitude" => done(telescope.set_site_longitude(params.parse("SiteLongitude")?)),
        "slewsettletime" => done(telescope.set_slew_settle_time(params.parse("SlewSettleTime")?)),
        "targetrightascension" => {
            done(telescope.set_target_right_ascension(params.parse("TargetRightAscension")?))
        }
        "targetdeclination" => {
            done(telescope.set_target_declination(params.parse("TargetDeclination")?))
        }
        "doesrefraction" => {
            params.boolean("DoesRefraction")?;
            Err(MountError::not_implemented("DoesRefraction write"))
        }
        "utcdate" => {
            params.required("UTCDate")?;
            Err(MountError::not_implemented("UTCDate write"))
        }

        _ => return Err(AlpacaError::unknown_operation("PUT", operation)),
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use starget_mount::{FixedClock, MountAxes, TelescopeConfig};
    use std::sync::Arc;

    fn telescope() -> Telescope {
        let config = TelescopeConfig::default();
        let (axes, _, _) = MountAxes::simulated(&config.axes);
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 20, 22, 0, 0).unwrap()));
        Telescope::new(config, axes, clock)
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let telescope = telescope();
        let err = get(&telescope, "warpfactor", &Params::default()).unwrap_err();
        assert!(matches!(err, AlpacaError::UnknownOperation { .. }));
        let err = put(&telescope, "altitude", &Params::default()).await.unwrap_err();
        assert!(matches!(err, AlpacaError::UnknownOperation { .. }));
    }

    #[tokio::test]
    async fn test_axis_rates_value() {
        let telescope = telescope();
        let params = Params::from_pairs([("Axis", "0")]);
        let value = get(&telescope, "axisrates", &params).unwrap().unwrap().unwrap();
        assert!(value[0]["Maximum"].as_f64().unwrap() > 0.0);
        assert_eq!(value[0]["Minimum"], json!(0.0));

        let params = Params::from_pairs([("Axis", "7")]);
        let reply = get(&telescope, "axisrates", &params).unwrap();
        assert_eq!(reply.unwrap_err().error_number(), 0x401);
    }

    #[tokio::test]
    async fn test_device_state_names() {
        let telescope = telescope();
        let value = get(&telescope, "devicestate", &Params::default())
            .unwrap()
            .unwrap()
            .unwrap();
        let names: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["Name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"Tracking"));
        assert!(names.contains(&"SideOfPier"));
        assert!(names.contains(&"TimeStamp"));
    }

    #[tokio::test]
    async fn test_target_unset_is_device_error() {
        let telescope = telescope();
        let reply = get(&telescope, "targetrightascension", &Params::default()).unwrap();
        assert_eq!(reply.unwrap_err().error_number(), 0x402);
    }

    #[tokio::test]
    async fn test_command_methods_not_implemented() {
        let telescope = telescope();
        let params = Params::from_pairs([("Command", "X"), ("Raw", "true")]);
        let reply = put(&telescope, "commandblind", &params).await.unwrap();
        assert_eq!(reply.unwrap_err().error_number(), 0x400);
    }
}
