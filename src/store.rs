use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Flat JSON file holding the user's monitored stops. The records are opaque
/// to the backend; whatever the frontend saved comes back verbatim.
pub struct MonitoredStops {
    path: PathBuf,
}

impl MonitoredStops {
    pub fn new(config_dir: &Path) -> Self {
        MonitoredStops {
            path: config_dir.join("monitored_stops.json"),
        }
    }

    pub fn load(&self) -> Vec<Value> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&text) {
            Ok(stops) => stops,
            Err(err) => {
                warn!("monitored stops file is unreadable, treating as empty: {err}");
                Vec::new()
            }
        }
    }

    pub fn save(&self, stops: &[Value]) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(stops)?;
        write_atomic(&self.path, &body)
    }
}

/// Write-to-temp-then-rename, so concurrent readers never observe a
/// half-written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("transit-board-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = MonitoredStops::new(&temp_dir("missing"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = MonitoredStops::new(&temp_dir("roundtrip"));
        let stops = vec![json!({"stop_id": 40380, "stop_name": "Clark/Lake"})];
        store.save(&stops).unwrap();
        assert_eq!(store.load(), stops);
    }

    #[test]
    fn garbage_file_loads_empty() {
        let dir = temp_dir("garbage");
        fs::write(dir.join("monitored_stops.json"), b"not json").unwrap();
        let store = MonitoredStops::new(&dir);
        assert!(store.load().is_empty());
    }
}
