use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Settings;

/// Station-level ids start here; anything below is dispatched to the bus
/// provider. Must stay consistent with `StopType::of`.
pub const RAIL_STATION_MIN_ID: u32 = 40_000;

const RAIL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const BUS_TIME_FORMAT: &str = "%Y%m%d %H:%M";

/// One normalized arrival prediction, shared by both providers.
#[derive(Debug, Clone, Serialize)]
pub struct Arrival {
    pub route: String,
    pub destination: String,
    /// Timestamp string exactly as the upstream sent it.
    pub arrival_time: String,
    /// Whole minutes until arrival, negative when overdue.
    pub minutes: i64,
    pub is_delayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_color: Option<String>,
    /// Which platform a bus prediction belongs to, when the query spanned
    /// directionally-paired stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unparseable upstream payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct TrainTrackerResponse {
    ctatt: Option<TrainEnvelope>,
}

#[derive(Debug, Deserialize)]
struct TrainEnvelope {
    eta: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct TrainEta {
    rt: String,
    #[serde(rename = "destNm")]
    dest_nm: String,
    #[serde(rename = "arrT")]
    arr_t: String,
    #[serde(rename = "isDly")]
    is_dly: String,
}

#[derive(Debug, Deserialize)]
struct BusTrackerResponse {
    #[serde(rename = "bustime-response")]
    bustime_response: Option<BusEnvelope>,
}

#[derive(Debug, Deserialize)]
struct BusEnvelope {
    prd: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct BusPrediction {
    rt: String,
    des: String,
    prdtm: String,
    stpid: String,
}

fn route_color(route: &str) -> Option<&'static str> {
    Some(match route {
        "Red" => "#c60c30",
        "Blue" => "#00a1de",
        "Brown" => "#62361b",
        "Green" => "#009b3a",
        "Orange" => "#f9461c",
        "Pink" => "#e27ea6",
        "Purple" => "#522398",
        "Yellow" => "#f9e300",
        _ => return None,
    })
}

/// Whole minutes between now and the arrival, truncated toward zero.
fn minutes_until(arrival: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (arrival - now).num_seconds() / 60
}

/// Normalize a rail prediction payload. Entries that do not carry the
/// expected fields or timestamp format are skipped, not fatal.
pub fn parse_rail_payload(body: &str, now: NaiveDateTime) -> Result<Vec<Arrival>, ProviderError> {
    let response: TrainTrackerResponse = serde_json::from_str(body)?;
    let mut arrivals = Vec::new();
    let Some(entries) = response.ctatt.and_then(|envelope| envelope.eta) else {
        return Ok(arrivals);
    };
    for entry in entries {
        let eta: TrainEta = match serde_json::from_value(entry) {
            Ok(eta) => eta,
            Err(err) => {
                debug!("skipping unreadable rail eta entry: {err}");
                continue;
            }
        };
        let arrival = match NaiveDateTime::parse_from_str(&eta.arr_t, RAIL_TIME_FORMAT) {
            Ok(arrival) => arrival,
            Err(err) => {
                debug!("skipping rail eta with bad timestamp {:?}: {err}", eta.arr_t);
                continue;
            }
        };
        arrivals.push(Arrival {
            route_color: route_color(&eta.rt).map(str::to_string),
            route: eta.rt,
            destination: eta.dest_nm,
            minutes: minutes_until(arrival, now),
            arrival_time: eta.arr_t,
            is_delayed: eta.is_dly == "1",
            stop_id: None,
        });
    }
    Ok(arrivals)
}

/// Normalize a bus prediction payload, sorted soonest-first. The bus
/// upstream carries no delay signal, so is_delayed is always false.
pub fn parse_bus_payload(body: &str, now: NaiveDateTime) -> Result<Vec<Arrival>, ProviderError> {
    let response: BusTrackerResponse = serde_json::from_str(body)?;
    let mut arrivals = Vec::new();
    let Some(entries) = response.bustime_response.and_then(|envelope| envelope.prd) else {
        return Ok(arrivals);
    };
    for entry in entries {
        let prediction: BusPrediction = match serde_json::from_value(entry) {
            Ok(prediction) => prediction,
            Err(err) => {
                debug!("skipping unreadable bus prediction entry: {err}");
                continue;
            }
        };
        let arrival = match NaiveDateTime::parse_from_str(&prediction.prdtm, BUS_TIME_FORMAT) {
            Ok(arrival) => arrival,
            Err(err) => {
                debug!(
                    "skipping bus prediction with bad timestamp {:?}: {err}",
                    prediction.prdtm
                );
                continue;
            }
        };
        let stop_id = match prediction.stpid.parse::<u32>() {
            Ok(stop_id) => stop_id,
            Err(_) => {
                debug!(
                    "skipping bus prediction with bad stop id {:?}",
                    prediction.stpid
                );
                continue;
            }
        };
        arrivals.push(Arrival {
            route: prediction.rt,
            destination: prediction.des,
            minutes: minutes_until(arrival, now),
            arrival_time: prediction.prdtm,
            is_delayed: false,
            route_color: None,
            stop_id: Some(stop_id),
        });
    }
    arrivals.sort_by_key(|arrival| arrival.minutes);
    Ok(arrivals)
}

pub fn is_rail_station(stop_id: u32) -> bool {
    stop_id >= RAIL_STATION_MIN_ID
}

/// The primary stop plus its directional pairs, comma-joined the way the
/// bus upstream expects its stpid parameter.
pub fn join_stop_ids(primary: u32, related: &[u32]) -> String {
    let mut ids = vec![primary];
    ids.extend_from_slice(related);
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Fans out to the rail and bus prediction upstreams and normalizes their
/// responses. Provider failures degrade to an empty list; callers never see
/// an upstream error.
pub struct ArrivalService {
    client: reqwest::Client,
    train_api_url: String,
    bus_api_url: String,
    train_api_key: String,
    bus_api_key: String,
}

impl ArrivalService {
    pub fn new(settings: &Settings, client: reqwest::Client) -> Self {
        ArrivalService {
            client,
            train_api_url: settings.train_api_url.clone(),
            bus_api_url: settings.bus_api_url.clone(),
            train_api_key: settings.train_api_key.clone(),
            bus_api_key: settings.bus_api_key.clone(),
        }
    }

    /// Route a stop query to the right provider by id range. Rail stations
    /// are self-contained, so related ids only matter for buses.
    pub async fn arrivals_for(&self, stop_id: u32, related: &[u32]) -> Vec<Arrival> {
        if is_rail_station(stop_id) {
            self.rail_arrivals(stop_id).await
        } else {
            self.bus_arrivals(stop_id, related).await
        }
    }

    pub async fn rail_arrivals(&self, station_id: u32) -> Vec<Arrival> {
        match self.fetch_rail(station_id).await {
            Ok(arrivals) => arrivals,
            Err(err) => {
                warn!("rail arrivals for station {station_id} unavailable: {err}");
                Vec::new()
            }
        }
    }

    pub async fn bus_arrivals(&self, stop_id: u32, related: &[u32]) -> Vec<Arrival> {
        match self.fetch_bus(stop_id, related).await {
            Ok(arrivals) => arrivals,
            Err(err) => {
                warn!("bus arrivals for stop {stop_id} unavailable: {err}");
                Vec::new()
            }
        }
    }

    async fn fetch_rail(&self, station_id: u32) -> Result<Vec<Arrival>, ProviderError> {
        let station = station_id.to_string();
        let body = self
            .client
            .get(&self.train_api_url)
            .query(&[
                ("key", self.train_api_key.as_str()),
                ("mapid", station.as_str()),
                ("outputType", "JSON"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_rail_payload(&body, Local::now().naive_local())
    }

    async fn fetch_bus(&self, stop_id: u32, related: &[u32]) -> Result<Vec<Arrival>, ProviderError> {
        let stpid = join_stop_ids(stop_id, related);
        let body = self
            .client
            .get(&self.bus_api_url)
            .query(&[
                ("key", self.bus_api_key.as_str()),
                ("stpid", stpid.as_str()),
                ("format", "json"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_bus_payload(&body, Local::now().naive_local())
    }
}
