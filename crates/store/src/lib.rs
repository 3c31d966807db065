//! Taller order store: the single owner of the work order collection.
//!
//! Commands mutate a private copy, persist the whole collection write-through
//! and publish a fresh immutable snapshot. Readers never block writers: they
//! load the current `Arc<OrderSnapshot>` and can subscribe to epoch changes.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use arc_swap::ArcSwap;
use metrics::counter;
use taller_core::{now_millis, Order, OrderEvent, OrderId, OrderPatch, OrderPayload, OrderSnapshot, OrderStatus, StoreResult};
use taller_persist::{DisplayIdAllocator, KvStore, OrderRepo, SqliteKv, ORDERS_KEY};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

mod config;
mod sync;

pub use config::StoreConfig;
pub use sync::spawn_sync;

/// Bookkeeping owned by whoever holds the command lock.
#[derive(Debug, Default)]
struct WriterState {
    /// Revision of the orders key this instance last wrote or loaded.
    seen_rev: Option<u64>,
    /// The last save failed; memory is ahead of storage.
    dirty: bool,
}

pub struct OrderStore {
    snap: ArcSwap<OrderSnapshot>,
    writer: Mutex<WriterState>,
    repo: OrderRepo,
    ids: DisplayIdAllocator,
    epoch_tx: watch::Sender<u64>,
    events: broadcast::Sender<OrderEvent>,
}

impl OrderStore {
    /// Build a store over `kv`, loading whatever collection it already holds.
    pub fn new(kv: Arc<dyn KvStore>, event_cap: usize) -> Self {
        let repo = OrderRepo::new(Arc::clone(&kv));
        let ids = DisplayIdAllocator::new(kv);
        let loaded = repo.load();
        info!(orders = loaded.orders.len(), rev = ?loaded.rev, "order store ready");
        let (epoch_tx, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(event_cap.max(1));
        Self {
            snap: ArcSwap::from_pointee(OrderSnapshot { epoch: 0, orders: loaded.orders }),
            writer: Mutex::new(WriterState { seen_rev: loaded.rev, dirty: false }),
            repo,
            ids,
            epoch_tx,
            events,
        }
    }

    /// Open the SQLite-backed store described by `cfg`.
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        let kv = SqliteKv::open(&cfg.db_path, &cfg.namespace)?;
        Ok(Self::new(Arc::new(kv), cfg.event_cap))
    }

    /// Token identifying this instance's writes in durable storage.
    pub fn writer_id(&self) -> &str {
        self.repo.kv().writer_id()
    }

    // ---- reads ----

    /// All orders, most recently created first.
    pub fn list(&self) -> Vec<Order> {
        self.snap.load().orders.clone()
    }

    pub fn snapshot(&self) -> Arc<OrderSnapshot> {
        self.snap.load_full()
    }

    pub fn get(&self, id: OrderId) -> Option<Order> {
        self.snap.load().get(id).cloned()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    // ---- commands ----

    /// Create a new order in `waiting`. Fails only when no display id could
    /// be allocated, in which case nothing is added.
    pub fn create(&self, payload: OrderPayload) -> StoreResult<Order> {
        let mut state = self.lock();
        let display_id = match self.ids.next() {
            Ok(d) => d,
            Err(e) => {
                self.notify(OrderEvent::AllocationFailed { reason: e.to_string() });
                return Err(e);
            }
        };
        let current = self.snap.load();
        let mut id = OrderId::new();
        while current.get(id).is_some() {
            id = OrderId::new();
        }
        let order = Order::new(id, display_id, payload, now_millis());
        let mut orders = Vec::with_capacity(current.orders.len() + 1);
        orders.push(order.clone());
        orders.extend(current.orders.iter().cloned());
        self.commit(&mut state, orders);
        counter!("orders_created_total", 1u64);
        info!(id = %order.id(), display_id = %order.display_id(), "order created");
        self.notify(OrderEvent::Created { display_id: order.display_id().to_string() });
        Ok(order)
    }

    /// Replace the supplied descriptive fields. Unknown ids are ignored.
    pub fn update(&self, id: OrderId, patch: OrderPatch) -> Option<Order> {
        let updated = self.modify(id, |o| {
            o.apply_patch(patch);
            Ok(())
        });
        let order = updated.ok().flatten()?;
        debug!(id = %id, display_id = %order.display_id(), "order updated");
        self.notify(OrderEvent::Updated { display_id: order.display_id().to_string() });
        Some(order)
    }

    /// Remove an order. Its display id is never handed out again.
    pub fn delete(&self, id: OrderId) -> bool {
        let mut state = self.lock();
        let current = self.snap.load();
        let Some(gone) = current.get(id).cloned() else {
            debug!(id = %id, "delete of unknown order ignored");
            return false;
        };
        let orders = current.orders.iter().filter(|o| o.id() != id).cloned().collect();
        self.commit(&mut state, orders);
        counter!("orders_deleted_total", 1u64);
        info!(id = %id, display_id = %gone.display_id(), "order deleted");
        self.notify(OrderEvent::Deleted { display_id: gone.display_id().to_string() });
        true
    }

    /// Move an order to `status`, appending to its history. Any writable
    /// state may follow any other. `Ok(None)` when the id is unknown;
    /// `InvalidStatus` for the read-only legacy state.
    pub fn change_status(&self, id: OrderId, status: OrderStatus) -> StoreResult<Option<Order>> {
        let now = now_millis();
        let changed = self.modify(id, |o| o.transition(status, now))?;
        if let Some(order) = &changed {
            counter!("orders_status_changed_total", 1u64);
            info!(id = %id, display_id = %order.display_id(), status = %status, "status changed");
            self.notify(OrderEvent::StatusChanged { display_id: order.display_id().to_string(), status });
        }
        Ok(changed)
    }

    pub fn complete(&self, id: OrderId) -> Option<Order> {
        self.change_status(id, OrderStatus::Completed).ok().flatten()
    }

    // ---- sync ----

    /// Reconcile with durable storage. When another instance wrote the
    /// collection since we last saw it, reload it in full and replace the
    /// in-memory copy; concurrent edits are not merged. A save that failed
    /// earlier is retried only if nobody else wrote in the meantime,
    /// otherwise the newer stored collection wins. Returns whether a reload
    /// happened.
    pub fn poll_external(&self) -> bool {
        let mut state = self.lock();
        let stamp = match self.repo.kv().stamp(ORDERS_KEY) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "sync: reading orders revision failed");
                return false;
            }
        };
        let external = stamp
            .as_ref()
            .filter(|s| state.seen_rev != Some(s.rev) && s.writer != self.writer_id());
        let Some(stamp) = external.cloned() else {
            if state.dirty {
                let current = self.snap.load();
                self.persist(&mut state, &current.orders);
            } else if let Some(own) = stamp {
                state.seen_rev = Some(own.rev);
            }
            return false;
        };
        if state.dirty {
            warn!(rev = stamp.rev, "unsaved local changes dropped; another instance wrote first");
            state.dirty = false;
        }
        let loaded = self.repo.load();
        let count = loaded.orders.len();
        state.seen_rev = loaded.rev.or(Some(stamp.rev));
        let epoch = self.publish(loaded.orders);
        counter!("sync_reloads_total", 1u64);
        info!(rev = stamp.rev, orders = count, epoch, "reloaded orders written by another instance");
        self.notify(OrderEvent::Synced { orders: count });
        true
    }

    // ---- internals ----

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to a copy of the order with `id` and commit it.
    fn modify(
        &self,
        id: OrderId,
        f: impl FnOnce(&mut Order) -> StoreResult<()>,
    ) -> StoreResult<Option<Order>> {
        let mut state = self.lock();
        let current = self.snap.load();
        let Some(idx) = current.orders.iter().position(|o| o.id() == id) else {
            debug!(id = %id, "command on unknown order ignored");
            return Ok(None);
        };
        let mut orders = current.orders.clone();
        f(&mut orders[idx])?;
        let changed = orders[idx].clone();
        self.commit(&mut state, orders);
        Ok(Some(changed))
    }

    fn commit(&self, state: &mut WriterState, orders: Vec<Order>) {
        self.persist(state, &orders);
        self.publish(orders);
    }

    /// Write-through; a failed save is logged and retried on the next sync poll.
    fn persist(&self, state: &mut WriterState, orders: &[Order]) {
        match self.repo.save(orders) {
            Ok(rev) => {
                state.seen_rev = Some(rev);
                state.dirty = false;
            }
            Err(e) => {
                warn!(error = ?e, "saving orders failed; will retry");
                counter!("persist_save_errors_total", 1u64);
                state.dirty = true;
            }
        }
    }

    fn publish(&self, orders: Vec<Order>) -> u64 {
        let epoch = self.snap.load().epoch.saturating_add(1);
        self.snap.store(Arc::new(OrderSnapshot { epoch, orders }));
        self.epoch_tx.send_replace(epoch);
        epoch
    }

    fn notify(&self, event: OrderEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use taller_core::StoreError;
    use taller_persist::MemoryKv;

    fn payload(plate: &str) -> OrderPayload {
        OrderPayload {
            plate: plate.into(),
            model: "Focus".into(),
            client_name: "Juan".into(),
            services: smallvec!["Balanceado".to_string()],
            notes: String::new(),
        }
    }

    fn store() -> (Arc<MemoryKv>, OrderStore) {
        let kv = Arc::new(MemoryKv::new());
        let s = OrderStore::new(kv.clone(), 16);
        (kv, s)
    }

    #[test]
    fn create_prepends_and_persists() {
        let (kv, s) = store();
        let a = s.create(payload("AAA111")).unwrap();
        let b = s.create(payload("BBB222")).unwrap();
        let ids: Vec<_> = s.list().iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![b.id(), a.id()]);
        let stored = kv.get(ORDERS_KEY).unwrap().unwrap();
        assert_eq!(stored.writer, s.writer_id());
        let on_disk: Vec<Order> = serde_json::from_str(&stored.value).unwrap();
        assert_eq!(on_disk, s.list());
    }

    #[test]
    fn allocation_failure_adds_nothing_and_emits_error() {
        let (kv, s) = store();
        let mut events = s.subscribe_events();
        kv.set_offline(true);
        let err = s.create(payload("AAA111")).unwrap_err();
        assert!(matches!(err, StoreError::Allocation(_)));
        assert!(s.list().is_empty());
        let ev = events.try_recv().unwrap();
        assert_eq!(ev.level(), taller_core::NoticeLevel::Error);
    }

    #[test]
    fn failed_save_is_retried_on_poll() {
        let (kv, s) = store();
        let o = s.create(payload("AAA111")).unwrap();
        kv.set_offline(true);
        s.update(o.id(), OrderPatch { notes: Some("frenos".into()), ..Default::default() }).unwrap();
        kv.set_offline(false);
        assert!(!s.poll_external());
        let on_disk: Vec<Order> = serde_json::from_str(&kv.get(ORDERS_KEY).unwrap().unwrap().value).unwrap();
        assert_eq!(on_disk[0].notes, "frenos");
    }

    #[test]
    fn epoch_advances_per_mutation() {
        let (_kv, s) = store();
        let rx = s.subscribe_epoch();
        let o = s.create(payload("AAA111")).unwrap();
        s.complete(o.id()).unwrap();
        assert!(!s.delete(OrderId::new()));
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(s.snapshot().epoch, 2);
    }

    #[test]
    fn own_writes_do_not_trigger_reload() {
        let (_kv, s) = store();
        s.create(payload("AAA111")).unwrap();
        assert!(!s.poll_external());
        assert_eq!(s.snapshot().epoch, 1);
    }
}
