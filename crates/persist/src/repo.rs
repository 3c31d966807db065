//! Whole-collection snapshots of the order list.

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use taller_core::Order;
use tracing::{debug, warn};

use crate::{KvStore, ORDERS_KEY};

/// Loaded collection plus the revision it was read at (`None` when the key
/// has never been written or could not be read).
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub orders: Vec<Order>,
    pub rev: Option<u64>,
}

/// Writes the full order collection under one key on every change and reads
/// it back on start or after another instance wrote it.
#[derive(Clone)]
pub struct OrderRepo {
    kv: Arc<dyn KvStore>,
}

impl OrderRepo {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Orders as currently stored. Missing, unreadable or corrupt data all
    /// come back as an empty collection.
    pub fn load(&self) -> Loaded {
        let stored = match self.kv.get(ORDERS_KEY) {
            Ok(Some(v)) => v,
            Ok(None) => return Loaded::default(),
            Err(e) => {
                warn!(error = ?e, "reading orders failed; starting empty");
                return Loaded::default();
            }
        };
        match serde_json::from_str::<Vec<Order>>(&stored.value) {
            Ok(orders) => {
                debug!(count = orders.len(), rev = stored.rev, "loaded orders");
                Loaded { orders, rev: Some(stored.rev) }
            }
            Err(e) => {
                warn!(error = %e, rev = stored.rev, "stored orders are corrupt; treating as empty");
                counter!("persist_load_corrupt_total", 1u64);
                Loaded { orders: Vec::new(), rev: Some(stored.rev) }
            }
        }
    }

    /// Replace the stored collection, returning the new revision.
    pub fn save(&self, orders: &[Order]) -> Result<u64> {
        let started = std::time::Instant::now();
        let body = encode(orders)?;
        let rev = self.kv.put(ORDERS_KEY, &body).context("saving orders")?;
        histogram!("persist_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count = orders.len(), rev, "saved orders");
        Ok(rev)
    }
}

pub fn encode(orders: &[Order]) -> Result<String> {
    serde_json::to_string(orders).context("serializing orders")
}
