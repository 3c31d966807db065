//! In-memory key-value store for tests and embedding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::{next_counter, parse_counter, KvStore, Stamp, Versioned};

/// Process-local store. Handles obtained through [`MemoryKv::attach`] share
/// the same data but write under their own token, which is how two running
/// instances are simulated inside one process.
pub struct MemoryKv {
    data: Arc<Mutex<HashMap<String, Versioned>>>,
    writer: String,
    offline: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            writer: uuid::Uuid::new_v4().to_string(),
            offline: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Another handle on the same data with a fresh writer token.
    pub fn attach(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            writer: uuid::Uuid::new_v4().to_string(),
            offline: Arc::clone(&self.offline),
        }
    }

    /// Make every call fail, as if the backing storage went away.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    /// Overwrite a raw value without touching the writer bookkeeping of
    /// other keys. Useful to plant corrupt data.
    pub fn put_raw(&self, key: &str, value: &str, writer: &str) -> u64 {
        let mut data = self.lock();
        write(&mut data, key, value.to_string(), writer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Versioned>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

fn write(data: &mut HashMap<String, Versioned>, key: &str, value: String, writer: &str) -> u64 {
    let rev = data.get(key).map(|v| v.rev + 1).unwrap_or(1);
    data.insert(key.to_string(), Versioned { value, rev, writer: writer.to_string() });
    rev
}

impl KvStore for MemoryKv {
    fn writer_id(&self) -> &str {
        &self.writer
    }

    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check_online()?;
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<u64> {
        self.check_online()?;
        let mut data = self.lock();
        Ok(write(&mut data, key, value.to_string(), &self.writer))
    }

    fn increment(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        let mut data = self.lock();
        let last = match data.get(key) {
            Some(v) => parse_counter(key, &v.value)?,
            None => 0,
        };
        let next = next_counter(key, last)?;
        write(&mut data, key, next.to_string(), &self.writer);
        Ok(next)
    }

    fn stamp(&self, key: &str) -> Result<Option<Stamp>> {
        self.check_online()?;
        Ok(self.lock().get(key).map(|v| Stamp { rev: v.rev, writer: v.writer.clone() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_handles_share_data_but_not_writer() {
        let a = MemoryKv::new();
        let b = a.attach();
        a.put("orders", "[]").unwrap();
        let seen = b.get("orders").unwrap().unwrap();
        assert_eq!(seen.writer, a.writer_id());
        assert_ne!(a.writer_id(), b.writer_id());
        assert_eq!(b.put("orders", "[1]").unwrap(), 2);
    }

    #[test]
    fn offline_fails_every_call() {
        let kv = MemoryKv::new();
        kv.set_offline(true);
        assert!(kv.get("orders").is_err());
        assert!(kv.increment("last_id").is_err());
        kv.set_offline(false);
        assert_eq!(kv.increment("last_id").unwrap(), 1);
    }
}
