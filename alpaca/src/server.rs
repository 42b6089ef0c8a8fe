//! Alpaca HTTP server
//!
//! Routes the management API and `/api/v1/telescope/{devnum}/{operation}`
//! onto one [`Telescope`]. Device errors come back as HTTP 200 with a
//! non-zero `ErrorNumber`; malformed requests get a plain-text 400.

use crate::envelope::{AlpacaResponse, DeviceReply};
use crate::error::AlpacaError;
use crate::params::Params;
use crate::{management, telescope, DEVICE_NUMBER};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use starget_mount::Telescope;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct AppState {
    telescope: Arc<Telescope>,
    verbose: bool,
}

pub fn router(telescope: Arc<Telescope>) -> Router {
    let verbose = telescope.config().server.verbose_driver_exceptions;
    let state = AppState { telescope, verbose };

    Router::new()
        .route("/management/apiversions", get(api_versions))
        .route("/management/v1/description", get(description))
        .route("/management/v1/configureddevices", get(configured_devices))
        .route(
            "/api/v1/telescope/:devnum/:operation",
            get(get_property).put(put_method),
        )
        .with_state(state)
        .layer(CatchPanicLayer::custom(move |panic| handle_panic(panic, verbose)))
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    telescope: Arc<Telescope>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("Alpaca server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(telescope))
        .with_graceful_shutdown(shutdown)
        .await
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>, verbose: bool) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Request handler panicked: {}", detail);

    let body = if verbose {
        format!("Internal server error: {}", detail)
    } else {
        "Internal server error".to_string()
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

fn check_device_number(devnum: &str) -> Result<(), AlpacaError> {
    match devnum.parse::<u32>() {
        Ok(n) if n == DEVICE_NUMBER => Ok(()),
        _ => Err(AlpacaError::InvalidDeviceNumber(devnum.to_string())),
    }
}

fn respond(state: &AppState, operation: &str, reply: DeviceReply, params: &Params) -> Response {
    if let Err(e) = &reply {
        if e.is_validation() {
            debug!("{} rejected: {}", operation, e);
        } else {
            warn!("{} failed: {}", operation, e);
        }
    }
    Json(AlpacaResponse::from_reply(&reply, params, state.verbose)).into_response()
}

async fn api_versions(Query(query): Query<HashMap<String, String>>) -> Json<AlpacaResponse> {
    Json(management::api_versions(&Params::from(query)))
}

async fn description(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<AlpacaResponse> {
    Json(management::description(&state.telescope, &Params::from(query)))
}

async fn configured_devices(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<AlpacaResponse> {
    Json(management::configured_devices(&state.telescope, &Params::from(query)))
}

async fn get_property(
    State(state): State<AppState>,
    Path((devnum, operation)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, AlpacaError> {
    check_device_number(&devnum)?;
    let operation = operation.to_ascii_lowercase();
    let params = Params::from(query);
    debug!(
        "GET {} (client {}, transaction {})",
        operation,
        params.client_id(),
        params.client_transaction_id()
    );

    let reply = telescope::get(&state.telescope, &operation, &params)?;
    Ok(respond(&state, &operation, reply, &params))
}

async fn put_method(
    State(state): State<AppState>,
    Path((devnum, operation)): Path<(String, String)>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, AlpacaError> {
    check_device_number(&devnum)?;
    let operation = operation.to_ascii_lowercase();
    let params = form.map(|Form(values)| Params::from(values)).unwrap_or_default();
    info!(
        "PUT {} (client {}, transaction {})",
        operation,
        params.client_id(),
        params.client_transaction_id()
    );

    let reply = telescope::put(&state.telescope, &operation, &params).await?;
    Ok(respond(&state, &operation, reply, &params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use starget_mount::{AxesConfig, AxisConfig, FixedClock, MountAxes, TelescopeConfig};
    use std::time::Duration;

    fn fast_axis(address: u8, home: i32, home_rate: f64) -> AxisConfig {
        AxisConfig {
            address,
            microsteps: 16,
            gear_ratio: 1.0,
            slew_rate: 2_000.0,
            max_move_rate: 50.0,
            home_rate,
            homing_timeout_secs: 2.0,
            move_timeout_secs: 3.0,
            poll_interval_ms: 5,
            sim_home_position: home,
            ..Default::default()
        }
    }

    fn test_telescope() -> Arc<Telescope> {
        let mut config = TelescopeConfig::default();
        config.device.site_latitude = 52.0;
        config.device.site_longitude = 5.0;
        config.axes = AxesConfig {
            ra: fast_axis(0xE0, 200, 500.0),
            dec: fast_axis(0xE1, -100, -500.0),
        };
        let (axes, _, _) = MountAxes::simulated(&config.axes);
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 20, 22, 0, 0).unwrap()));
        Arc::new(Telescope::new(config, axes, clock))
    }

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn start() -> (String, Arc<Telescope>) {
        let telescope = test_telescope();
        (spawn(router(telescope.clone())).await, telescope)
    }

    async fn put(client: &reqwest::Client, url: String, form: &[(&str, &str)]) -> Value {
        let response = client.put(url).form(form).send().await.unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    #[tokio::test]
    async fn test_get_property_envelope() {
        let (base, _telescope) = start().await;
        let body: Value = reqwest::get(format!(
            "{}/api/v1/telescope/0/connected?ClientTransactionID=17",
            base
        ))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(body["Value"], Value::Bool(false));
        assert_eq!(body["ClientTransactionID"], 17);
        assert_eq!(body["ErrorNumber"], 0);
        assert_eq!(body["ErrorMessage"], "");
    }

    #[tokio::test]
    async fn test_operation_names_are_case_insensitive() {
        let (base, _telescope) = start().await;
        let body: Value = reqwest::get(format!("{}/api/v1/telescope/0/CanSlewAsync", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Value"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_connect_and_slew() {
        let (base, telescope) = start().await;
        let client = reqwest::Client::new();

        let body = put(
            &client,
            format!("{}/api/v1/telescope/0/connected", base),
            &[("Connected", "True"), ("ClientTransactionID", "3")],
        )
        .await;
        assert_eq!(body["ErrorNumber"], 0);
        assert_eq!(body["ClientTransactionID"], 3);
        assert!(body.get("Value").is_none());
        assert!(telescope.connected());

        let body = put(
            &client,
            format!("{}/api/v1/telescope/0/slewtocoordinates", base),
            &[("RightAscension", "6.5"), ("Declination", "30")],
        )
        .await;
        assert_eq!(body["ErrorNumber"], 0);
        assert!(!telescope.is_slewing());
        assert!((telescope.declination() - 30.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_device_errors_travel_in_envelope() {
        let (base, _telescope) = start().await;
        let client = reqwest::Client::new();

        let body = put(
            &client,
            format!("{}/api/v1/telescope/0/slewtocoordinatesasync", base),
            &[("RightAscension", "6.5"), ("Declination", "30")],
        )
        .await;
        assert_eq!(body["ErrorNumber"], 0x407);

        let body = put(
            &client,
            format!("{}/api/v1/telescope/0/connected", base),
            &[("Connected", "true")],
        )
        .await;
        assert_eq!(body["ErrorNumber"], 0);

        let body = put(
            &client,
            format!("{}/api/v1/telescope/0/slewtocoordinatesasync", base),
            &[("RightAscension", "6.5"), ("Declination", "95")],
        )
        .await;
        assert_eq!(body["ErrorNumber"], 0x401);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (base, _telescope) = start().await;
        let client = reqwest::Client::new();

        let response = reqwest::get(format!("{}/api/v1/telescope/1/connected", base))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = reqwest::get(format!("{}/api/v1/telescope/zero/connected", base))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = reqwest::get(format!("{}/api/v1/telescope/0/warpdrive", base))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = client
            .put(format!("{}/api/v1/telescope/0/slewtocoordinatesasync", base))
            .form(&[("RightAscension", "6.5")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        assert!(response.text().await.unwrap().contains("Declination"));

        let response = client
            .put(format!("{}/api/v1/telescope/0/tracking", base))
            .form(&[("Tracking", "maybe")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_management_api() {
        let (base, _telescope) = start().await;

        let body: Value = reqwest::get(format!("{}/management/apiversions", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Value"], serde_json::json!([1]));

        let body: Value = reqwest::get(format!("{}/management/v1/configureddevices", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Value"][0]["DeviceType"], "Telescope");
        assert_eq!(body["Value"][0]["DeviceNumber"], 0);

        let body: Value = reqwest::get(format!("{}/management/v1/description", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["Value"]["ServerName"].is_string());
        assert_eq!(body["Value"]["Manufacturer"], "Starget");
    }

    async fn boom() -> &'static str {
        panic!("axis table corrupt")
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let app = Router::new()
            .route("/boom", get(boom))
            .layer(CatchPanicLayer::custom(|panic| handle_panic(panic, true)));
        let base = spawn(app).await;

        let response = reqwest::get(format!("{}/boom", base)).await.unwrap();
        assert_eq!(response.status(), 500);
        assert!(response.text().await.unwrap().contains("axis table corrupt"));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, test_telescope(), async {
            let _ = stop_rx.await;
        }));
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
