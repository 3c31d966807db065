use std::time::Duration;

use taller_persist::DEFAULT_NAMESPACE;

/// Runtime knobs, read from `TALLER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_path: String,
    pub namespace: String,
    pub sync_interval: Duration,
    pub event_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: taller_persist::default_db_path(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            sync_interval: Duration::from_millis(500),
            event_cap: 64,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(p) = get("TALLER_DB_PATH").filter(|s| !s.is_empty()) {
            cfg.db_path = p;
        }
        if let Some(ns) = get("TALLER_NAMESPACE").filter(|s| !s.is_empty()) {
            cfg.namespace = ns;
        }
        if let Some(ms) = get("TALLER_SYNC_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.sync_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(cap) = get("TALLER_EVENT_CAP").and_then(|s| s.parse::<usize>().ok()) {
            cfg.event_cap = cap.max(1);
        }
        cfg
    }
}
