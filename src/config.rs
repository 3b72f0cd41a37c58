use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

const DEFAULT_TRAIN_API_URL: &str = "http://lapi.transitchicago.com/api/1.0/ttarrivals.aspx";
const DEFAULT_BUS_API_URL: &str = "http://www.ctabustracker.com/bustime/api/v2/getpredictions";
const DEFAULT_STOP_DATA_URL: &str =
    "https://www.transitchicago.com/downloads/sch_data/CTA_STOP_XFERS.txt";

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub train_api_key: String,
    pub bus_api_key: String,
    pub train_api_url: String,
    pub bus_api_url: String,
    pub stop_data_url: String,
    /// Seconds between spontaneous pushes on the live channel.
    pub update_interval_secs: u64,
    pub cache_enabled: bool,
    /// Max age of the stop dataset cache before a refetch, in seconds.
    pub cache_duration_secs: i64,
    /// Cap on simultaneous in-flight provider calls during a push cycle.
    pub max_concurrent_stops: usize,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            train_api_key: env_or("TRAIN_API_KEY", ""),
            bus_api_key: env_or("BUS_API_KEY", ""),
            train_api_url: env_or("TRAIN_API_URL", DEFAULT_TRAIN_API_URL),
            bus_api_url: env_or("BUS_API_URL", DEFAULT_BUS_API_URL),
            stop_data_url: env_or("STOP_DATA_URL", DEFAULT_STOP_DATA_URL),
            update_interval_secs: env_parse("UPDATE_INTERVAL", 30),
            cache_enabled: env_parse("CACHE_ENABLED", true),
            cache_duration_secs: env_parse("CACHE_DURATION", 86_400),
            max_concurrent_stops: env_parse("MAX_CONCURRENT_STOPS", 10),
            port: env_parse("PORT", 3030),
            cache_dir: PathBuf::from(env_or("CACHE_DIR", "cache")),
            data_dir: PathBuf::from(env_or("DATA_DIR", "data")),
            config_dir: PathBuf::from(env_or("CONFIG_DIR", "config")),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{name}={raw} is not valid, falling back to the default");
            default
        }),
        Err(_) => default,
    }
}
