use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::geo::distance_miles;
use crate::store::write_atomic;

/// One row of the upstream stop-transfer table. The last column is carried
/// only so the local backup round-trips; nothing downstream reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStopRecord {
    pub route_id: String,
    pub route_code: String,
    pub stop_name: String,
    pub stop_id: u32,
    pub stop_lat: f64,
    pub stop_lon: f64,
    pub heading_degrees: f64,
    pub transfer_to_route_id: String,
}

/// Stop category, encoded by the upstream numbering convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Bus,
    Train,
    ParentTrain,
    Unknown,
}

impl StopType {
    pub fn of(stop_id: u32) -> Self {
        match stop_id {
            0..=29_999 => StopType::Bus,
            30_000..=39_999 => StopType::Train,
            40_000..=49_999 => StopType::ParentTrain,
            _ => StopType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedStop {
    pub raw: RawStopRecord,
    pub stop_type: StopType,
    /// Station-level id for platform-level train stops; the stop's own id
    /// for everything else.
    pub parent_stop_id: u32,
}

pub fn classify(raw: RawStopRecord) -> ClassifiedStop {
    let stop_type = StopType::of(raw.stop_id);
    let parent_stop_id = match stop_type {
        StopType::Train => 40_000 + (raw.stop_id - 30_000),
        _ => raw.stop_id,
    };
    ClassifiedStop {
        raw,
        stop_type,
        parent_stop_id,
    }
}

/// API-facing stop, already consolidated and distance-annotated.
#[derive(Debug, Clone, Serialize)]
pub struct StopView {
    pub stop_id: u32,
    pub stop_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub routes: Vec<String>,
    pub distance: f64,
    pub related_stop_ids: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct NearbyStops {
    pub train_stops: Vec<StopView>,
    pub bus_stops: Vec<StopView>,
}

#[derive(Debug, Error)]
#[error("stop dataset unavailable: {reason}")]
pub struct DataUnavailable {
    reason: String,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stop table was empty or unreadable")]
    EmptyTable,
}

#[derive(Debug)]
pub struct Catalog {
    pub fetched_at: DateTime<Utc>,
    pub stops: Vec<ClassifiedStop>,
}

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    fetched_at: DateTime<Utc>,
    stops: Vec<RawStopRecord>,
}

/// Loads and caches the citywide stop-transfer dataset and answers proximity
/// queries against it. The classified set is rebuilt wholesale whenever the
/// cache expires; between refreshes it is immutable and shared by reference.
pub struct StopCatalog {
    client: reqwest::Client,
    data_url: String,
    cache_enabled: bool,
    ttl: Duration,
    cache_file: PathBuf,
    backup_file: PathBuf,
    current: RwLock<Option<Arc<Catalog>>>,
}

impl StopCatalog {
    pub fn new(settings: &Settings, client: reqwest::Client) -> Self {
        StopCatalog {
            client,
            data_url: settings.stop_data_url.clone(),
            cache_enabled: settings.cache_enabled,
            ttl: Duration::seconds(settings.cache_duration_secs),
            cache_file: settings.cache_dir.join("stops.json"),
            backup_file: settings.data_dir.join("stop_transfers.csv"),
            current: RwLock::new(None),
        }
    }

    pub async fn find_nearby(
        &self,
        lat: f64,
        lon: f64,
        radius: f64,
    ) -> Result<NearbyStops, DataUnavailable> {
        let catalog = self.classified().await?;
        Ok(nearby_from(&catalog.stops, lat, lon, radius))
    }

    /// Current classified catalog, refreshing from disk or the remote
    /// dataset when the in-memory snapshot is missing or expired.
    pub async fn classified(&self) -> Result<Arc<Catalog>, DataUnavailable> {
        if self.cache_enabled {
            if let Some(catalog) = self.current.read().await.as_ref() {
                if Utc::now() - catalog.fetched_at < self.ttl {
                    return Ok(Arc::clone(catalog));
                }
            }
        }

        let mut slot = self.current.write().await;
        // another request may have refreshed while we waited for the lock
        if self.cache_enabled {
            if let Some(catalog) = slot.as_ref() {
                if Utc::now() - catalog.fetched_at < self.ttl {
                    return Ok(Arc::clone(catalog));
                }
            }
        }
        let catalog = Arc::new(self.refresh().await?);
        *slot = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    async fn refresh(&self) -> Result<Catalog, DataUnavailable> {
        if self.cache_enabled {
            if let Some(catalog) = self.load_cache_snapshot() {
                return Ok(catalog);
            }
        }

        match self.fetch_remote().await {
            Ok(raw) => {
                let fetched_at = Utc::now();
                if let Err(err) = self.persist(&raw, fetched_at) {
                    warn!("could not persist stop dataset copies: {err}");
                }
                info!("loaded {} stop records from upstream", raw.len());
                Ok(Catalog {
                    fetched_at,
                    stops: raw.into_iter().map(classify).collect(),
                })
            }
            Err(err) => {
                warn!("stop dataset download failed, trying local backup: {err}");
                self.load_backup().ok_or_else(|| DataUnavailable {
                    reason: format!("no cached dataset, no local backup, and {err}"),
                })
            }
        }
    }

    async fn fetch_remote(&self) -> Result<Vec<RawStopRecord>, FetchError> {
        let body = self
            .client
            .get(&self.data_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let records = parse_stop_table(body.as_bytes());
        if records.is_empty() {
            return Err(FetchError::EmptyTable);
        }
        Ok(records)
    }

    fn load_cache_snapshot(&self) -> Option<Catalog> {
        let text = fs::read_to_string(&self.cache_file).ok()?;
        let snapshot: CacheSnapshot = match serde_json::from_str(&text) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("stop cache snapshot is unreadable, refetching: {err}");
                return None;
            }
        };
        if Utc::now() - snapshot.fetched_at >= self.ttl {
            return None;
        }
        debug!("using stop cache snapshot from {}", snapshot.fetched_at);
        Some(Catalog {
            fetched_at: snapshot.fetched_at,
            stops: snapshot.stops.into_iter().map(classify).collect(),
        })
    }

    /// Backup fallback after a failed download. No TTL check here; stale
    /// stop geometry beats none at all.
    fn load_backup(&self) -> Option<Catalog> {
        let bytes = fs::read(&self.backup_file).ok()?;
        let records = parse_stop_table(&bytes);
        if records.is_empty() {
            return None;
        }
        info!(
            "serving {} stop records from the local backup",
            records.len()
        );
        // stamped already-expired so the next request retries the download
        // instead of treating backup data as fresh for a full TTL
        Some(Catalog {
            fetched_at: Utc::now() - self.ttl,
            stops: records.into_iter().map(classify).collect(),
        })
    }

    fn persist(&self, records: &[RawStopRecord], fetched_at: DateTime<Utc>) -> io::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for record in records {
            writer.serialize(record).map_err(io::Error::other)?;
        }
        let table = writer
            .into_inner()
            .map_err(|err| io::Error::other(err.to_string()))?;
        write_atomic(&self.backup_file, &table)?;

        let snapshot = CacheSnapshot {
            fetched_at,
            stops: records.to_vec(),
        };
        write_atomic(&self.cache_file, &serde_json::to_vec(&snapshot)?)
    }
}

/// Parse the headerless 8-column stop-transfer table. Rows that do not
/// deserialize are skipped rather than failing the whole load.
pub fn parse_stop_table(bytes: &[u8]) -> Vec<RawStopRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(bytes);
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in reader.deserialize() {
        match row {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("skipped {skipped} malformed rows in the stop table");
    }
    records
}

/// Proximity query over an already-classified stop set. Train output is
/// station-level stops only; bus stops sharing a (name, route) pair collapse
/// into one view whose related ids are the other directional platforms.
pub fn nearby_from(stops: &[ClassifiedStop], lat: f64, lon: f64, radius: f64) -> NearbyStops {
    let mut train_stops = Vec::new();
    let mut bus_groups: BTreeMap<(String, String), Vec<(&ClassifiedStop, f64)>> = BTreeMap::new();

    for stop in stops {
        let distance = distance_miles(lat, lon, stop.raw.stop_lat, stop.raw.stop_lon);
        if distance > radius {
            continue;
        }
        match stop.stop_type {
            StopType::ParentTrain => train_stops.push(StopView {
                stop_id: stop.parent_stop_id,
                stop_name: stop.raw.stop_name.clone(),
                latitude: stop.raw.stop_lat,
                longitude: stop.raw.stop_lon,
                routes: vec![stop.raw.route_id.clone()],
                distance,
                related_stop_ids: Vec::new(),
            }),
            StopType::Bus => bus_groups
                .entry((stop.raw.stop_name.clone(), stop.raw.route_id.clone()))
                .or_default()
                .push((stop, distance)),
            // platform-level train stops are suppressed; their parent
            // station surfaces instead
            StopType::Train | StopType::Unknown => {}
        }
    }

    let mut bus_stops = Vec::new();
    for members in bus_groups.into_values() {
        let mut primary = 0;
        for (i, member) in members.iter().enumerate() {
            if member.1 < members[primary].1 {
                primary = i;
            }
        }
        let related_stop_ids: Vec<u32> = members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary)
            .map(|(_, (stop, _))| stop.raw.stop_id)
            .collect();
        let (stop, distance) = &members[primary];
        bus_stops.push(StopView {
            stop_id: stop.parent_stop_id,
            stop_name: stop.raw.stop_name.clone(),
            latitude: stop.raw.stop_lat,
            longitude: stop.raw.stop_lon,
            routes: vec![stop.raw.route_id.clone()],
            distance: *distance,
            related_stop_ids,
        });
    }

    train_stops.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
    });
    bus_stops.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
    });

    NearbyStops {
        train_stops,
        bus_stops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // port 9 (discard) refuses connections immediately, so the download
    // path fails fast without touching the network
    const UNREACHABLE_URL: &str = "http://127.0.0.1:9/stop_table";

    fn test_settings(tag: &str) -> Settings {
        let base = std::env::temp_dir().join(format!(
            "transit-board-catalog-{tag}-{}",
            std::process::id()
        ));
        Settings {
            train_api_key: String::new(),
            bus_api_key: String::new(),
            train_api_url: String::new(),
            bus_api_url: String::new(),
            stop_data_url: UNREACHABLE_URL.to_string(),
            update_interval_secs: 30,
            cache_enabled: true,
            cache_duration_secs: 86_400,
            max_concurrent_stops: 10,
            port: 0,
            cache_dir: base.join("cache"),
            data_dir: base.join("data"),
            config_dir: base.join("config"),
        }
    }

    fn record(stop_id: u32, name: &str, route: &str, lat: f64, lon: f64) -> RawStopRecord {
        RawStopRecord {
            route_id: route.to_string(),
            route_code: route.to_string(),
            stop_name: name.to_string(),
            stop_id,
            stop_lat: lat,
            stop_lon: lon,
            heading_degrees: 0.0,
            transfer_to_route_id: String::new(),
        }
    }

    fn stop(stop_id: u32, name: &str, route: &str, lat: f64, lon: f64) -> ClassifiedStop {
        classify(record(stop_id, name, route, lat, lon))
    }

    #[test]
    fn stop_type_ranges() {
        assert_eq!(StopType::of(0), StopType::Bus);
        assert_eq!(StopType::of(29_999), StopType::Bus);
        assert_eq!(StopType::of(30_000), StopType::Train);
        assert_eq!(StopType::of(39_999), StopType::Train);
        assert_eq!(StopType::of(40_000), StopType::ParentTrain);
        assert_eq!(StopType::of(49_999), StopType::ParentTrain);
        assert_eq!(StopType::of(50_000), StopType::Unknown);
    }

    #[test]
    fn train_parent_id_arithmetic() {
        let child = stop(30_123, "Clark/Lake", "Blue", 41.88, -87.63);
        assert_eq!(child.stop_type, StopType::Train);
        assert_eq!(child.parent_stop_id, 40_123);
        assert_eq!(StopType::of(child.parent_stop_id), StopType::ParentTrain);

        let parent = stop(40_123, "Clark/Lake", "Blue", 41.88, -87.63);
        assert_eq!(parent.parent_stop_id, 40_123);

        let bus = stop(1001, "Main & 1st", "22", 41.88, -87.63);
        assert_eq!(bus.parent_stop_id, 1001);
    }

    #[test]
    fn platform_level_train_stops_are_suppressed() {
        let stops = vec![
            stop(30_123, "Clark/Lake", "Blue", 41.8858, -87.6309),
            stop(40_123, "Clark/Lake", "Blue", 41.8858, -87.6309),
        ];
        let nearby = nearby_from(&stops, 41.8858, -87.6309, 0.5);
        assert_eq!(nearby.train_stops.len(), 1);
        assert_eq!(nearby.train_stops[0].stop_id, 40_123);
        assert!(nearby.train_stops[0].related_stop_ids.is_empty());
        assert_eq!(nearby.train_stops[0].routes, vec!["Blue".to_string()]);
        assert!(nearby.bus_stops.is_empty());
    }

    #[test]
    fn bus_pair_consolidates_to_nearest() {
        // 1001 sits on the query point, 1002 is the far-side platform
        let stops = vec![
            stop(1002, "Main & 1st", "22", 41.884, -87.63),
            stop(1001, "Main & 1st", "22", 41.88, -87.63),
        ];
        let nearby = nearby_from(&stops, 41.88, -87.63, 0.5);
        assert_eq!(nearby.bus_stops.len(), 1);
        let primary = &nearby.bus_stops[0];
        assert_eq!(primary.stop_id, 1001);
        assert_eq!(primary.related_stop_ids, vec![1002]);
        assert!(!primary.related_stop_ids.contains(&primary.stop_id));
    }

    #[test]
    fn distinct_routes_do_not_consolidate() {
        let stops = vec![
            stop(1001, "Main & 1st", "22", 41.88, -87.63),
            stop(1003, "Main & 1st", "36", 41.88, -87.63),
        ];
        let nearby = nearby_from(&stops, 41.88, -87.63, 0.5);
        assert_eq!(nearby.bus_stops.len(), 2);
        for view in &nearby.bus_stops {
            assert!(view.related_stop_ids.is_empty());
        }
    }

    #[test]
    fn radius_is_inclusive_and_monotonic() {
        let stops = vec![
            stop(1001, "Near", "22", 41.88, -87.63),
            stop(1002, "Mid", "36", 41.90, -87.63),
            stop(1003, "Far", "8", 42.00, -87.63),
        ];
        let narrow = nearby_from(&stops, 41.88, -87.63, 0.5);
        let wide = nearby_from(&stops, 41.88, -87.63, 2.0);
        assert_eq!(narrow.bus_stops.len(), 1);
        assert_eq!(wide.bus_stops.len(), 2);
        for view in narrow.bus_stops.iter().chain(wide.bus_stops.iter()) {
            assert!(view.distance <= 2.0);
        }
        // every narrow result also appears in the wide result
        for view in &narrow.bus_stops {
            assert!(wide.bus_stops.iter().any(|w| w.stop_id == view.stop_id));
        }
    }

    #[test]
    fn results_sorted_by_distance() {
        let stops = vec![
            stop(40_200, "Outer Station", "Red", 41.90, -87.63),
            stop(40_100, "Inner Station", "Red", 41.881, -87.63),
        ];
        let nearby = nearby_from(&stops, 41.88, -87.63, 5.0);
        assert_eq!(nearby.train_stops[0].stop_id, 40_100);
        assert!(nearby.train_stops[0].distance <= nearby.train_stops[1].distance);
    }

    #[tokio::test]
    async fn fresh_cache_snapshot_is_served_without_fetching() {
        let settings = test_settings("snapshot");
        let snapshot = CacheSnapshot {
            fetched_at: Utc::now(),
            stops: vec![record(1001, "Main & 1st", "22", 41.88, -87.63)],
        };
        write_atomic(
            &settings.cache_dir.join("stops.json"),
            &serde_json::to_vec(&snapshot).unwrap(),
        )
        .unwrap();

        let catalog = StopCatalog::new(&settings, reqwest::Client::new());
        let loaded = catalog.classified().await.unwrap();
        assert_eq!(loaded.stops.len(), 1);
        assert_eq!(loaded.stops[0].raw.stop_id, 1001);
        assert_eq!(loaded.stops[0].stop_type, StopType::Bus);
    }

    #[tokio::test]
    async fn failed_download_falls_back_to_backup() {
        let settings = test_settings("backup");
        write_atomic(
            &settings.data_dir.join("stop_transfers.csv"),
            b"22,805,Main & 1st,1001,41.88,-87.63,90.0,\n",
        )
        .unwrap();

        let catalog = StopCatalog::new(&settings, reqwest::Client::new());
        let loaded = catalog.classified().await.unwrap();
        assert_eq!(loaded.stops.len(), 1);
        assert_eq!(loaded.stops[0].raw.stop_id, 1001);
        // fallback data is published already-expired so the next request
        // retries the download rather than coasting on the backup
        assert!(Utc::now() - loaded.fetched_at >= Duration::seconds(settings.cache_duration_secs));
    }

    #[tokio::test]
    async fn no_cache_no_backup_failed_fetch_is_unavailable() {
        let settings = test_settings("unavailable");
        let catalog = StopCatalog::new(&settings, reqwest::Client::new());
        let err = catalog.classified().await.unwrap_err();
        assert!(err.to_string().contains("stop dataset unavailable"));
    }

    #[test]
    fn parses_headerless_table_and_skips_bad_rows() {
        let table = b"8,805,Halsted & 63rd,1001,41.7790,-87.6446,270.0,G\n\
            Red,901,95th/Dan Ryan,30089,41.7224,-87.6243,0.0,\n\
            not,a,valid,row,x,y,z,w\n";
        let records = parse_stop_table(table);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stop_id, 1001);
        assert_eq!(records[0].route_id, "8");
        assert_eq!(records[1].stop_id, 30_089);
        assert!(records[1].transfer_to_route_id.is_empty());
    }
}
