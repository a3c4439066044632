//! `redb`-backed [`StorageEngine`].
//!
//! `redb` is a single-file, ordered, multi-reader/single-writer embedded
//! database -- exactly the semantics spec'd for the storage layer (strict
//! lexicographic iteration, internally serialized writes, concurrent
//! readers via snapshot transactions), so none of that has to be built by
//! hand the way an in-memory map would require.
//!
//! Two tables back each engine instance:
//! - `kv`: `key -> [ttl_header(9 bytes) ++ value bytes]`. The header is a
//!   flag byte (0/1 = has TTL) followed by an 8-byte big-endian
//!   `expires_at` when present, so a plain `get` never needs a second
//!   table lookup to know whether a value has expired.
//! - `ttl_index`: `"<20-digit expires_at>\0<key>" -> key`, kept in sync on
//!   every put/delete so the TTL monitor can scan expirations in
//!   ascending order without a full table walk.

use std::ops::Bound;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nimbus_core::{EngineError, EngineResult};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::engine::{BatchOp, FetchResult, IterationCursor, StorageEngine, StoredEntry};

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const TTL_INDEX: TableDefinition<&str, &str> = TableDefinition::new("ttl_index");

pub struct RedbEngine {
    db: Database,
}

impl RedbEngine {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let db = Database::create(path)
            .map_err(|e| EngineError::internal(format!("opening storage database: {e}")))?;
        {
            let txn = db
                .begin_write()
                .map_err(|e| EngineError::internal(e.to_string()))?;
            txn.open_table(KV).map_err(|e| EngineError::internal(e.to_string()))?;
            txn.open_table(TTL_INDEX).map_err(|e| EngineError::internal(e.to_string()))?;
            txn.commit().map_err(|e| EngineError::internal(e.to_string()))?;
        }
        Ok(Self { db })
    }

    #[must_use]
    pub fn in_memory() -> EngineResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| EngineError::internal(format!("opening in-memory storage: {e}")))?;
        {
            let txn = db
                .begin_write()
                .map_err(|e| EngineError::internal(e.to_string()))?;
            txn.open_table(KV).map_err(|e| EngineError::internal(e.to_string()))?;
            txn.open_table(TTL_INDEX).map_err(|e| EngineError::internal(e.to_string()))?;
            txn.commit().map_err(|e| EngineError::internal(e.to_string()))?;
        }
        Ok(Self { db })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn ttl_index_key(expires_at: u64, key: &str) -> String {
    format!("{expires_at:020}\0{key}")
}

fn encode(entry: &StoredEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + entry.value.len());
    match entry.expires_at {
        Some(at) => {
            buf.push(1);
            buf.extend_from_slice(&at.to_be_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&[0u8; 8]);
        }
    }
    buf.extend_from_slice(&entry.value);
    buf
}

fn decode(bytes: &[u8]) -> EngineResult<StoredEntry> {
    if bytes.len() < 9 {
        return Err(EngineError::internal("corrupt stored entry"));
    }
    let expires_at = if bytes[0] == 1 {
        let mut be = [0u8; 8];
        be.copy_from_slice(&bytes[1..9]);
        Some(u64::from_be_bytes(be))
    } else {
        None
    };
    Ok(StoredEntry { value: bytes[9..].to_vec(), expires_at })
}

fn map_err<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::internal(e.to_string())
}

impl StorageEngine for RedbEngine {
    fn get(&self, key: &str) -> EngineResult<Option<StoredEntry>> {
        let txn = self.db.begin_read().map_err(map_err)?;
        let table = txn.open_table(KV).map_err(map_err)?;
        let Some(raw) = table.get(key).map_err(map_err)? else {
            return Ok(None);
        };
        let entry = decode(raw.value())?;
        if entry.is_expired(now_millis()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn put(&self, key: &str, entry: StoredEntry) -> EngineResult<Option<StoredEntry>> {
        let txn = self.db.begin_write().map_err(map_err)?;
        let previous = {
            let mut kv = txn.open_table(KV).map_err(map_err)?;
            let mut ttl_idx = txn.open_table(TTL_INDEX).map_err(map_err)?;
            let previous = kv
                .insert(key, encode(&entry).as_slice())
                .map_err(map_err)?
                .map(|v| decode(v.value()))
                .transpose()?;
            if let Some(prev) = &previous {
                if let Some(old_at) = prev.expires_at {
                    ttl_idx.remove(ttl_index_key(old_at, key).as_str()).map_err(map_err)?;
                }
            }
            if let Some(at) = entry.expires_at {
                ttl_idx.insert(ttl_index_key(at, key).as_str(), key).map_err(map_err)?;
            }
            previous
        };
        txn.commit().map_err(map_err)?;
        Ok(previous)
    }

    fn delete(&self, key: &str) -> EngineResult<Option<StoredEntry>> {
        let txn = self.db.begin_write().map_err(map_err)?;
        let removed = {
            let mut kv = txn.open_table(KV).map_err(map_err)?;
            let mut ttl_idx = txn.open_table(TTL_INDEX).map_err(map_err)?;
            let removed = kv.remove(key).map_err(map_err)?.map(|v| decode(v.value())).transpose()?;
            if let Some(entry) = &removed {
                if let Some(at) = entry.expires_at {
                    ttl_idx.remove(ttl_index_key(at, key).as_str()).map_err(map_err)?;
                }
            }
            removed
        };
        txn.commit().map_err(map_err)?;
        Ok(removed)
    }

    fn has(&self, key: &str) -> EngineResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn set_ttl(&self, key: &str, expires_at: Option<u64>) -> EngineResult<bool> {
        let txn = self.db.begin_write().map_err(map_err)?;
        let updated = {
            let mut kv = txn.open_table(KV).map_err(map_err)?;
            let mut ttl_idx = txn.open_table(TTL_INDEX).map_err(map_err)?;
            let Some(raw) = kv.get(key).map_err(map_err)?.map(|v| v.value().to_vec()) else {
                return Ok(false);
            };
            let mut entry = decode(&raw)?;
            if let Some(old_at) = entry.expires_at {
                ttl_idx.remove(ttl_index_key(old_at, key).as_str()).map_err(map_err)?;
            }
            entry.expires_at = expires_at;
            kv.insert(key, encode(&entry).as_slice()).map_err(map_err)?;
            if let Some(at) = expires_at {
                ttl_idx.insert(ttl_index_key(at, key).as_str(), key).map_err(map_err)?;
            }
            true
        };
        txn.commit().map_err(map_err)?;
        Ok(updated)
    }

    fn len(&self) -> EngineResult<usize> {
        let txn = self.db.begin_read().map_err(map_err)?;
        let table = txn.open_table(KV).map_err(map_err)?;
        Ok(usize::try_from(table.len().map_err(map_err)?).unwrap_or(usize::MAX))
    }

    fn clear(&self, keep_system: bool) -> EngineResult<u64> {
        let txn = self.db.begin_write().map_err(map_err)?;
        let mut removed = 0u64;
        {
            let mut kv = txn.open_table(KV).map_err(map_err)?;
            let mut ttl_idx = txn.open_table(TTL_INDEX).map_err(map_err)?;
            let keys: Vec<String> = kv
                .iter()
                .map_err(map_err)?
                .filter_map(Result::ok)
                .map(|(k, _)| k.value().to_string())
                .filter(|k| !keep_system || !k.starts_with("/_system/"))
                .collect();
            for key in keys {
                if let Some(raw) = kv.remove(key.as_str()).map_err(map_err)? {
                    let entry = decode(raw.value())?;
                    if let Some(at) = entry.expires_at {
                        ttl_idx.remove(ttl_index_key(at, &key).as_str()).map_err(map_err)?;
                    }
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err)?;
        Ok(removed)
    }

    fn fetch_keys(
        &self,
        prefix: &str,
        cursor: &IterationCursor,
        size: usize,
    ) -> EngineResult<FetchResult<String>> {
        let page = self.fetch_entries(prefix, cursor, size)?;
        Ok(FetchResult {
            items: page.items.into_iter().map(|(k, _)| k).collect(),
            next_cursor: page.next_cursor,
        })
    }

    fn fetch_entries(
        &self,
        prefix: &str,
        cursor: &IterationCursor,
        size: usize,
    ) -> EngineResult<FetchResult<(String, StoredEntry)>> {
        let txn = self.db.begin_read().map_err(map_err)?;
        let table = txn.open_table(KV).map_err(map_err)?;

        let start = if cursor.state.is_empty() {
            prefix.to_string()
        } else {
            String::from_utf8(cursor.state.clone())
                .map_err(|_| EngineError::internal("corrupt iteration cursor"))?
        };
        let bounds: (Bound<&str>, Bound<&str>) = if cursor.state.is_empty() {
            (Bound::Included(start.as_str()), Bound::Unbounded)
        } else {
            (Bound::Excluded(start.as_str()), Bound::Unbounded)
        };

        let now = now_millis();
        let mut items = Vec::new();
        let mut next_state = cursor.state.clone();
        let mut finished = true;
        for row in table.range::<&str>(bounds).map_err(map_err)? {
            let (k, v) = row.map_err(map_err)?;
            let key = k.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            if items.len() >= size {
                finished = false;
                break;
            }
            let entry = decode(v.value())?;
            next_state = key.clone().into_bytes();
            if !entry.is_expired(now) {
                items.push((key, entry));
            }
        }

        Ok(FetchResult { items, next_cursor: IterationCursor { state: next_state, finished } })
    }

    fn expiring_keys(&self, limit: usize) -> EngineResult<Vec<(String, u64)>> {
        let txn = self.db.begin_read().map_err(map_err)?;
        let table = txn.open_table(TTL_INDEX).map_err(map_err)?;
        let mut out = Vec::with_capacity(limit);
        for row in table.iter().map_err(map_err)? {
            if out.len() >= limit {
                break;
            }
            let (idx_key, key) = row.map_err(map_err)?;
            let idx_key = idx_key.value();
            let Some((expires_at_str, _)) = idx_key.split_once('\0') else {
                continue;
            };
            let Ok(expires_at) = expires_at_str.parse::<u64>() else {
                continue;
            };
            out.push((key.value().to_string(), expires_at));
        }
        Ok(out)
    }

    fn apply_batch(&self, ops: &[BatchOp]) -> EngineResult<Vec<String>> {
        let txn = self.db.begin_write().map_err(map_err)?;
        let mut affected = Vec::with_capacity(ops.len());
        {
            let mut kv = txn.open_table(KV).map_err(map_err)?;
            let mut ttl_idx = txn.open_table(TTL_INDEX).map_err(map_err)?;
            for op in ops {
                match op {
                    BatchOp::Put { key, entry } => {
                        let previous = kv
                            .insert(key.as_str(), encode(entry).as_slice())
                            .map_err(map_err)?
                            .map(|v| decode(v.value()))
                            .transpose()?;
                        if let Some(prev) = previous {
                            if let Some(old_at) = prev.expires_at {
                                ttl_idx
                                    .remove(ttl_index_key(old_at, key).as_str())
                                    .map_err(map_err)?;
                            }
                        }
                        if let Some(at) = entry.expires_at {
                            ttl_idx.insert(ttl_index_key(at, key).as_str(), key.as_str()).map_err(map_err)?;
                        }
                    }
                    BatchOp::Delete { key } => {
                        if let Some(prev) = kv.remove(key.as_str()).map_err(map_err)? {
                            let prev = decode(prev.value())?;
                            if let Some(old_at) = prev.expires_at {
                                ttl_idx
                                    .remove(ttl_index_key(old_at, key).as_str())
                                    .map_err(map_err)?;
                            }
                        }
                    }
                }
                affected.push(op.key().to_string());
            }
        }
        txn.commit().map_err(map_err)?;
        Ok(affected)
    }
}
