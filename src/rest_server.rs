use crate::db::HistoryStore;
use crate::models::{LevelSummary, Pump, PumpThresholds, TankRecord};
use crate::signals::Signal;
use crate::telemetry_hub::TelemetryHub;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Deserialize, Serialize};
use rocket::{get, post, routes, Build, Rocket, State};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Readings older than this are flagged as stale.
const STALE_AFTER: Duration = Duration::from_secs(300);

/// Threshold update request
#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct ThresholdRequest {
    min: i32,
    max: i32,
}

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct StatusResponse {
    phase: String,
    client_id: Option<String>,
    subscriptions: Vec<SubscriptionResponse>,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct SubscriptionResponse {
    filter: String,
    active: bool,
}

/// One latest-value cell
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct SignalResponse {
    name: String,
    value: Option<f32>,
    updated_at_ms: Option<i64>,
    stale: Option<bool>,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct HistoryResponse {
    tank_id: String,
    readings: Vec<TankRecord>,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

fn signal_response(hub: &TelemetryHub, signal: Signal) -> SignalResponse {
    let reading = hub.reading(signal);
    SignalResponse {
        name: signal.as_str().to_string(),
        value: reading.map(|r| r.value),
        updated_at_ms: reading.map(|r| r.updated_at_ms()),
        stale: reading.map(|r| r.is_stale(STALE_AFTER)),
    }
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "Fluir telemetry hub".to_string(),
    })
}

/// Connection phase and subscriptions
#[get("/status")]
fn status(hub: &State<TelemetryHub>) -> Json<StatusResponse> {
    Json(StatusResponse {
        phase: hub.phase().to_string(),
        client_id: hub.client_id(),
        subscriptions: hub
            .subscriptions()
            .into_iter()
            .map(|s| SubscriptionResponse {
                filter: s.filter,
                active: s.active,
            })
            .collect(),
    })
}

/// Every latest-value cell
#[get("/signals")]
fn all_signals(hub: &State<TelemetryHub>) -> Json<Vec<SignalResponse>> {
    Json(
        Signal::ALL
            .into_iter()
            .map(|signal| signal_response(hub, signal))
            .collect(),
    )
}

#[get("/signals/<name>")]
fn one_signal(name: &str, hub: &State<TelemetryHub>) -> Result<Json<SignalResponse>, Status> {
    let signal: Signal = name.parse().map_err(|_| Status::NotFound)?;
    Ok(Json(signal_response(hub, signal)))
}

/// Get the last `n` recorded levels of a tank
#[get("/tanks/<tank_id>/history?<limit>")]
fn tank_history(
    tank_id: &str,
    limit: Option<usize>,
    store: &State<Arc<HistoryStore>>,
) -> Result<Json<HistoryResponse>, Status> {
    let limit = limit.unwrap_or(10); // Default limit is 10
    match store.recent_readings(tank_id, limit) {
        Ok(readings) => Ok(Json(HistoryResponse {
            tank_id: tank_id.to_string(),
            readings,
        })),
        Err(e) => {
            error!("Failed to read history of {}: {:?}", tank_id, e);
            Err(Status::InternalServerError)
        }
    }
}

/// Most recent recorded level of a tank
#[get("/tanks/<tank_id>/latest")]
fn tank_latest(tank_id: &str, store: &State<Arc<HistoryStore>>) -> Result<Json<TankRecord>, Status> {
    match store.latest_reading(tank_id) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(Status::NotFound),
        Err(e) => {
            error!("Failed to read latest level of {}: {:?}", tank_id, e);
            Err(Status::InternalServerError)
        }
    }
}

#[get("/tanks/<tank_id>/summary")]
fn tank_summary(tank_id: &str, store: &State<Arc<HistoryStore>>) -> Result<Json<LevelSummary>, Status> {
    match store.summary(tank_id) {
        Ok(Some(summary)) => Ok(Json(summary)),
        Ok(None) => Err(Status::NotFound),
        Err(e) => {
            error!("Failed to summarize {}: {:?}", tank_id, e);
            Err(Status::InternalServerError)
        }
    }
}

/// Publish new pump thresholds
#[post("/pumps/<pump>/thresholds", data = "<payload>")]
fn set_thresholds(
    pump: &str,
    payload: Json<ThresholdRequest>,
    hub: &State<TelemetryHub>,
) -> Result<(Status, Json<ApiResponse>), Status> {
    let pump: Pump = pump.parse().map_err(|_| Status::NotFound)?;

    let thresholds = match PumpThresholds::new(payload.min, payload.max) {
        Ok(thresholds) => thresholds,
        Err(e) => {
            return Ok((
                Status::UnprocessableEntity,
                Json(ApiResponse {
                    status: "error".to_string(),
                    message: e.to_string(),
                }),
            ))
        }
    };

    match hub.publish_thresholds(pump, &thresholds) {
        Ok(_completion) => Ok((
            Status::Accepted,
            Json(ApiResponse {
                status: "success".to_string(),
                message: format!("thresholds {}-{} queued", thresholds.min(), thresholds.max()),
            }),
        )),
        Err(e) => {
            error!("Failed to publish thresholds: {}", e);
            Err(Status::InternalServerError)
        }
    }
}

/// Assemble the Rocket instance
pub fn build_rocket(
    hub: TelemetryHub,
    store: Arc<HistoryStore>,
    address: &str,
    port: u16,
) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", address.to_string()))
        .merge(("port", port));

    rocket::custom(figment)
        .manage(hub)
        .manage(store)
        .mount(
            "/",
            routes![
                root_handler,
                status,
                all_signals,
                one_signal,
                tank_history,
                tank_latest,
                tank_summary,
                set_thresholds
            ],
        )
        .attach(Cors)
}

/// Run the Rocket server
pub async fn run_rest_server(
    hub: TelemetryHub,
    store: Arc<HistoryStore>,
    address: &str,
    port: u16,
) -> Result<(), rocket::Error> {
    build_rocket(hub, store, address, port).launch().await?;
    Ok(())
}
