use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Key-value store with per-key expiry, addressed by plain string keys.
///
/// Values are strings so that counters and scores keep the same wire shape
/// regardless of the backend. Expired keys behave as if absent.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write only when the key is absent or expired. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Increment an integer value, creating it at 1. Keeps any existing expiry.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a new expiry on an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live; `None` when the key is absent or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    expires_at: Option<i64>, // unix millis, None = never expires
}

impl Entry {
    fn new(value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self { value: value.into(), expires_at: ttl.map(deadline) }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn remaining(&self, now: i64) -> Option<Duration> {
        self.expires_at
            .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0)))
    }

    fn bumped(&self) -> Result<Self> {
        let current: i64 = self
            .value
            .parse()
            .with_context(|| format!("value `{}` is not an integer", self.value))?;
        Ok(Self { value: (current + 1).to_string(), expires_at: self.expires_at })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline(ttl: Duration) -> i64 {
    now_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

pub struct Memory {
    kind: MemoryKind,
}

enum MemoryKind {
    LMDB {
        env: Env,
        db: Database<Bytes, Bytes>,
    },
    Memory {
        map: DashMap<String, Entry>,
    },
}

const LMDB_DB_NAME: &str = "tollgate-kv";

impl Memory {
    /// Open LMDB storage at given path
    pub fn open_lmdb<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())
            .with_context(|| format!("create lmdb dir {}", path.as_ref().display()))?;
        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(8)
                .map_size(1024 * 1024 * 1024)
                .open(path.as_ref())?
        };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(LMDB_DB_NAME))?;
        wtxn.commit()?;
        Ok(Self { kind: MemoryKind::LMDB { env, db } })
    }

    /// Open in-memory storage
    pub fn memory() -> Self {
        Self { kind: MemoryKind::Memory { map: DashMap::new() } }
    }

    pub fn engine(&self) -> &'static str {
        match &self.kind {
            MemoryKind::LMDB { .. } => "lmdb",
            MemoryKind::Memory { .. } => "memory",
        }
    }

    fn read_entry(&self, key: &str) -> Result<Option<Entry>> {
        let now = now_millis();
        let entry = match &self.kind {
            MemoryKind::LMDB { env, db } => {
                let rtxn = env.read_txn()?;
                let found = match db.get(&rtxn, key.as_bytes())? {
                    Some(bytes) => Some(rmp_serde::from_slice::<Entry>(bytes)?),
                    None => None,
                };
                found
            }
            MemoryKind::Memory { map } => map.get(key).map(|e| e.value().clone()),
        };
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    fn write_entry(&self, key: &str, entry: Entry) -> Result<()> {
        match &self.kind {
            MemoryKind::LMDB { env, db } => {
                let bytes = rmp_serde::to_vec(&entry)?;
                let mut wtxn = env.write_txn()?;
                db.put(&mut wtxn, key.as_bytes(), &bytes)?;
                wtxn.commit()?;
            }
            MemoryKind::Memory { map } => {
                map.insert(key.to_string(), entry);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for Memory {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_entry(key)?.map(|e| e.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write_entry(key, Entry::new(value, Some(ttl)))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = now_millis();
        let next = match &self.kind {
            MemoryKind::LMDB { env, db } => {
                // read-modify-write inside one write txn; LMDB serializes writers
                let mut wtxn = env.write_txn()?;
                let current = match db.get(&wtxn, key.as_bytes())? {
                    Some(bytes) => Some(rmp_serde::from_slice::<Entry>(bytes)?),
                    None => None,
                };
                let next = match current.filter(|e| !e.is_expired(now)) {
                    Some(e) => e.bumped()?,
                    None => Entry::new("1", None),
                };
                let bytes = rmp_serde::to_vec(&next)?;
                db.put(&mut wtxn, key.as_bytes(), &bytes)?;
                wtxn.commit()?;
                next
            }
            MemoryKind::Memory { map } => {
                let mut slot = map.entry(key.to_string()).or_insert_with(|| Entry::new("0", None));
                let next = if slot.is_expired(now) {
                    Entry::new("1", None)
                } else {
                    slot.bumped()?
                };
                *slot = next.clone();
                next
            }
        };
        Ok(next.value.parse::<i64>()?)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        match &self.kind {
            MemoryKind::LMDB { env, db } => {
                let mut wtxn = env.write_txn()?;
                let live = match db.get(&wtxn, key.as_bytes())? {
                    Some(bytes) => !rmp_serde::from_slice::<Entry>(bytes)?.is_expired(now),
                    None => false,
                };
                if live {
                    return Ok(false);
                }
                let bytes = rmp_serde::to_vec(&Entry::new(value, Some(ttl)))?;
                db.put(&mut wtxn, key.as_bytes(), &bytes)?;
                wtxn.commit()?;
                Ok(true)
            }
            MemoryKind::Memory { map } => match map.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                    if !slot.get().is_expired(now) {
                        return Ok(false);
                    }
                    slot.insert(Entry::new(value, Some(ttl)));
                    Ok(true)
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Entry::new(value, Some(ttl)));
                    Ok(true)
                }
            },
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        match &self.kind {
            MemoryKind::LMDB { env, db } => {
                let mut wtxn = env.write_txn()?;
                let current = match db.get(&wtxn, key.as_bytes())? {
                    Some(bytes) => Some(rmp_serde::from_slice::<Entry>(bytes)?),
                    None => None,
                };
                let Some(mut entry) = current.filter(|e| !e.is_expired(now)) else {
                    return Ok(false);
                };
                entry.expires_at = Some(deadline(ttl));
                let bytes = rmp_serde::to_vec(&entry)?;
                db.put(&mut wtxn, key.as_bytes(), &bytes)?;
                wtxn.commit()?;
                Ok(true)
            }
            MemoryKind::Memory { map } => match map.get_mut(key) {
                Some(mut entry) if !entry.is_expired(now) => {
                    entry.expires_at = Some(deadline(ttl));
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = now_millis();
        Ok(self.read_entry(key)?.and_then(|e| e.remaining(now)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match &self.kind {
            MemoryKind::LMDB { env, db } => {
                let mut wtxn = env.write_txn()?;
                db.delete(&mut wtxn, key.as_bytes())?;
                wtxn.commit()?;
            }
            MemoryKind::Memory { map } => {
                map.remove(key);
            }
        }
        Ok(())
    }
}
