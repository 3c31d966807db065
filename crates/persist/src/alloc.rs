//! Sequential display numbers backed by the durable counter.

use std::sync::Arc;

use metrics::counter;
use taller_core::{StoreError, StoreResult};
use tracing::{error, trace};

use crate::{KvStore, LAST_ID_KEY};

/// Hands out `0001`, `0002`, ... from a counter every instance shares.
/// Numbers are never reused, even after the order holding one is deleted.
#[derive(Clone)]
pub struct DisplayIdAllocator {
    kv: Arc<dyn KvStore>,
}

impl DisplayIdAllocator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Issue the next number. Call once per created order.
    pub fn next(&self) -> StoreResult<String> {
        match self.kv.increment(LAST_ID_KEY) {
            Ok(n) => {
                trace!(n, "allocated display id");
                Ok(format_display_id(n))
            }
            Err(e) => {
                error!(error = ?e, "display id allocation failed");
                counter!("order_alloc_failures_total", 1u64);
                Err(StoreError::Allocation(format!("{:#}", e)))
            }
        }
    }
}

/// Zero-padded to four digits; larger numbers keep all their digits.
pub fn format_display_id(n: u64) -> String {
    format!("{:04}", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    #[test]
    fn starts_at_one_and_pads() {
        let alloc = DisplayIdAllocator::new(Arc::new(MemoryKv::new()));
        assert_eq!(alloc.next().unwrap(), "0001");
        assert_eq!(alloc.next().unwrap(), "0002");
        assert_eq!(format_display_id(12345), "12345");
    }

    #[test]
    fn continues_from_stored_counter() {
        let kv = MemoryKv::new();
        kv.put_raw(LAST_ID_KEY, "41", "old-release");
        let alloc = DisplayIdAllocator::new(Arc::new(kv));
        assert_eq!(alloc.next().unwrap(), "0042");
    }

    #[test]
    fn exhausted_counter_fails_instead_of_wrapping() {
        let kv = Arc::new(MemoryKv::new());
        kv.put_raw(LAST_ID_KEY, &u64::MAX.to_string(), "x");
        let alloc = DisplayIdAllocator::new(kv.clone());
        assert!(matches!(alloc.next(), Err(StoreError::Allocation(_))));
        assert_eq!(kv.get(LAST_ID_KEY).unwrap().unwrap().value, u64::MAX.to_string());
    }

    #[test]
    fn unavailable_or_corrupt_counter_fails() {
        let kv = Arc::new(MemoryKv::new());
        let alloc = DisplayIdAllocator::new(kv.clone());
        kv.set_offline(true);
        assert!(matches!(alloc.next(), Err(StoreError::Allocation(_))));
        kv.set_offline(false);
        kv.put_raw(LAST_ID_KEY, "oops", "x");
        assert!(matches!(alloc.next(), Err(StoreError::Allocation(_))));
    }
}
