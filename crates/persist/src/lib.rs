//! Taller persistence: a small versioned key-value store with SQLite and
//! in-memory backends, plus the order snapshot adapter and the display id
//! counter built on top of it.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::histogram;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod alloc;
mod memory;
mod repo;

pub use alloc::{format_display_id, DisplayIdAllocator};
pub use memory::MemoryKv;
pub use repo::{encode, Loaded, OrderRepo};

/// Key holding the serialized order collection.
pub const ORDERS_KEY: &str = "orders";
/// Key holding the last display number handed out.
pub const LAST_ID_KEY: &str = "last_id";
/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "workshop";

/// A stored value together with its write revision and the writer that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: String,
    pub rev: u64,
    pub writer: String,
}

/// Revision marker of a key, cheap to poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub rev: u64,
    pub writer: String,
}

/// Durable string store shared by every running instance.
///
/// Each handle carries its own writer token so readers can tell their own
/// writes from those made by other instances.
pub trait KvStore: Send + Sync {
    fn writer_id(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<Versioned>>;
    /// Replace the value, returning the key's new revision.
    fn put(&self, key: &str, value: &str) -> Result<u64>;
    /// Atomically read a decimal counter (0 when absent), add one, store and return it.
    fn increment(&self, key: &str) -> Result<u64>;
    fn stamp(&self, key: &str) -> Result<Option<Stamp>>;
}

/// Parse a stored counter. Anything but a plain decimal is corrupt.
pub(crate) fn parse_counter(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| anyhow!("counter {} holds {:?}: {}", key, raw, e))
}

/// The value after `last`; a counter at its ceiling cannot issue another.
pub(crate) fn next_counter(key: &str, last: u64) -> Result<u64> {
    last.checked_add(1).ok_or_else(|| anyhow!("counter {} is exhausted at {}", key, last))
}

/// SQLite-backed store. Simple, synchronous; several processes may share the file.
pub struct SqliteKv {
    db: std::sync::Mutex<rusqlite::Connection>,
    ns: String,
    writer: String,
}

impl SqliteKv {
    pub fn open(path: &str, ns: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.busy_timeout(Duration::from_secs(5)).context("setting busy timeout")?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                ns     TEXT NOT NULL,
                key    TEXT NOT NULL,
                value  TEXT NOT NULL,
                rev    INTEGER NOT NULL,
                writer TEXT NOT NULL,
                ts     INTEGER NOT NULL,
                PRIMARY KEY (ns, key)
            )",
            [],
        )
        .context("creating kv table")?;
        let writer = uuid::Uuid::new_v4().to_string();
        debug!(path, ns, writer = %writer, "opened kv store");
        let me = Self { db: std::sync::Mutex::new(db), ns: ns.to_string(), writer };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const UPSERT: &str = "INSERT INTO kv(ns, key, value, rev, writer, ts) VALUES (?1, ?2, ?3, 1, ?4, ?5)
     ON CONFLICT(ns, key) DO UPDATE SET
         value = excluded.value, rev = kv.rev + 1, writer = excluded.writer, ts = excluded.ts
     RETURNING rev";

impl KvStore for SqliteKv {
    fn writer_id(&self) -> &str { &self.writer }

    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let db = self.conn();
        let row = db
            .query_row(
                "SELECT value, rev, writer FROM kv WHERE ns = ?1 AND key = ?2",
                (&self.ns, key),
                |row| {
                    Ok(Versioned {
                        value: row.get(0)?,
                        rev: row.get::<_, i64>(1)? as u64,
                        writer: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("reading key {}", key))?;
        Ok(row)
    }

    fn put(&self, key: &str, value: &str) -> Result<u64> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let rev: i64 = tx
            .query_row(UPSERT, (&self.ns, key, value, &self.writer, now_ts()), |row| row.get(0))
            .with_context(|| format!("writing key {}", key))?;
        tx.commit()?;
        Ok(rev as u64)
    }

    fn increment(&self, key: &str) -> Result<u64> {
        let mut db = self.conn();
        // IMMEDIATE takes the write lock up front so no other process can
        // read the same counter value between our read and write.
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("locking counter {}", key))?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE ns = ?1 AND key = ?2", (&self.ns, key), |row| row.get(0))
            .optional()?;
        let last = match current {
            Some(raw) => parse_counter(key, &raw)?,
            None => 0,
        };
        let next = next_counter(key, last)?;
        tx.query_row(UPSERT, (&self.ns, key, next.to_string(), &self.writer, now_ts()), |row| {
            row.get::<_, i64>(0)
        })?;
        tx.commit()?;
        Ok(next)
    }

    fn stamp(&self, key: &str) -> Result<Option<Stamp>> {
        let db = self.conn();
        let row = db
            .query_row(
                "SELECT rev, writer FROM kv WHERE ns = ?1 AND key = ?2",
                (&self.ns, key),
                |row| Ok(Stamp { rev: row.get::<_, i64>(0)? as u64, writer: row.get(1)? }),
            )
            .optional()?;
        Ok(row)
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".taller");
        let _ = std::fs::create_dir_all(&p);
        p.push("taller.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "taller.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
