mod arrivals;
mod config;
mod error;
mod geo;
mod live;
mod stops;
mod store;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::arrivals::{Arrival, ArrivalService};
use crate::config::Settings;
use crate::error::AppError;
use crate::stops::{NearbyStops, StopCatalog};
use crate::store::MonitoredStops;

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    catalog: Arc<StopCatalog>,
    arrivals: Arc<ArrivalService>,
    monitored: Arc<MonitoredStops>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("failed to build http client");

    let state = AppState {
        catalog: Arc::new(StopCatalog::new(&settings, client.clone())),
        arrivals: Arc::new(ArrivalService::new(&settings, client)),
        monitored: Arc::new(MonitoredStops::new(&settings.config_dir)),
        settings: Arc::new(settings),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/stops", get(get_stops))
        .route("/arrivals/{stop_id}", get(get_arrivals))
        .route(
            "/monitored-stops",
            get(get_monitored_stops).post(save_monitored_stops),
        )
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    info!("serving on http://{addr}");
    axum::serve(listener, app).await.expect("server error");
}

#[derive(Debug, Deserialize)]
struct StopsQuery {
    lat: f64,
    lon: f64,
    #[serde(default = "default_radius")]
    radius: f64,
}

fn default_radius() -> f64 {
    0.5
}

async fn get_stops(
    State(state): State<AppState>,
    Query(query): Query<StopsQuery>,
) -> Result<Json<NearbyStops>, AppError> {
    let nearby = state
        .catalog
        .find_nearby(query.lat, query.lon, query.radius)
        .await?;
    Ok(Json(nearby))
}

#[derive(Debug, Deserialize)]
struct ArrivalsQuery {
    /// JSON array string, e.g. `related_stop_ids=[1002,1003]`.
    related_stop_ids: Option<String>,
}

async fn get_arrivals(
    State(state): State<AppState>,
    Path(stop_id): Path<u32>,
    Query(query): Query<ArrivalsQuery>,
) -> Result<Json<Vec<Arrival>>, AppError> {
    let related = match query.related_stop_ids.as_deref() {
        Some(raw) => serde_json::from_str::<Vec<u32>>(raw).map_err(|err| {
            AppError::BadRequest(format!(
                "related_stop_ids must be a JSON array of stop ids: {err}"
            ))
        })?,
        None => Vec::new(),
    };
    Ok(Json(state.arrivals.arrivals_for(stop_id, &related).await))
}

async fn get_monitored_stops(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.monitored.load())
}

async fn save_monitored_stops(
    State(state): State<AppState>,
    Json(stops): Json<Vec<Value>>,
) -> Result<Json<Value>, AppError> {
    state.monitored.save(&stops)?;
    Ok(Json(json!({ "message": "Stops saved successfully" })))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let arrivals = Arc::clone(&state.arrivals);
    let interval = Duration::from_secs(state.settings.update_interval_secs);
    let max_concurrent = state.settings.max_concurrent_stops;
    ws.on_upgrade(move |socket| live::run(socket, arrivals, interval, max_concurrent))
}
