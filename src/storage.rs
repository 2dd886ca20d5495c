//! Ordered key-value storage backing every index record.
//!
//! Keys and values are printable ASCII. All range reads are lexicographic on
//! the key, which is what the zero-padded decimal fields in the key schema
//! rely on.

use crate::error::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Ordered list of writes applied atomically. Later operations on the same
/// key win.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Apply every operation of `batch` or none of them.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// All entries with `start <= key < limit`, in key order.
    fn scan(&self, start: &str, limit: &str) -> Result<Vec<(String, String)>, StorageError>;

    fn count(&self, start: &str, limit: &str) -> Result<usize, StorageError> {
        Ok(self.scan(start, limit)?.len())
    }

    /// Greatest entry with `start <= key < limit`.
    fn last_in_range(
        &self,
        start: &str,
        limit: &str,
    ) -> Result<Option<(String, String)>, StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|source| StorageError::DatabaseOpen {
            name: "index".to_string(),
            source,
        })?;
        Ok(Self { db })
    }

    /// Wrap an already opened database (temporary databases in tests).
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    fn decode(key: &[u8], value: sled::IVec) -> Result<(String, String), StorageError> {
        let key = String::from_utf8(key.to_vec()).map_err(|_| StorageError::InvalidUtf8 {
            key: String::from_utf8_lossy(key).into_owned(),
        })?;
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| StorageError::InvalidUtf8 { key: key.clone() })?;
        Ok((key, value))
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(Self::decode(key.as_bytes(), value)?.1)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => sled_batch.insert(key.as_bytes(), value.as_bytes()),
                BatchOp::Delete { key } => sled_batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn scan(&self, start: &str, limit: &str) -> Result<Vec<(String, String)>, StorageError> {
        if start >= limit {
            return Ok(Vec::new());
        }
        self.db
            .range(start.as_bytes()..limit.as_bytes())
            .map(|item| {
                let (key, value) = item?;
                Self::decode(&key, value)
            })
            .collect()
    }

    fn count(&self, start: &str, limit: &str) -> Result<usize, StorageError> {
        if start >= limit {
            return Ok(0);
        }
        let mut count = 0;
        for item in self.db.range(start.as_bytes()..limit.as_bytes()) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn last_in_range(
        &self,
        start: &str,
        limit: &str,
    ) -> Result<Option<(String, String)>, StorageError> {
        if start >= limit {
            return Ok(None);
        }
        match self
            .db
            .range(start.as_bytes()..limit.as_bytes())
            .next_back()
        {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some(Self::decode(&key, value)?))
            }
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Non-durable store for tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the full key space.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, start: &str, limit: &str) -> Result<Vec<(String, String)>, StorageError> {
        if start >= limit {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .read()
            .range(start.to_string()..limit.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_in_range(
        &self,
        start: &str,
        limit: &str,
    ) -> Result<Option<(String, String)>, StorageError> {
        if start >= limit {
            return Ok(None);
        }
        Ok(self
            .entries
            .read()
            .range(start.to_string()..limit.to_string())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temporary_sled() -> SledStore {
        SledStore::from_db(sled::Config::new().temporary(true).open().unwrap())
    }

    fn exercise_ordering(store: &dyn KeyValueStore) {
        store.put("a-txo-00000002", "two").unwrap();
        store.put("a-txo-00000010", "ten").unwrap();
        store.put("a-txo-00000001", "one").unwrap();
        store.put("b-txo-00000001", "other").unwrap();

        let entries = store.scan("a-txo-00000001", "a-txo-99999999").unwrap();
        let values: Vec<&str> = entries.iter().map(|(_, v)| v.as_str()).collect();
        assert_eq!(values, vec!["one", "two", "ten"]);
        assert_eq!(store.count("a-txo-00000001", "a-txo-99999999").unwrap(), 3);
        assert_eq!(
            store
                .last_in_range("a-txo-00000001", "a-txo-99999999")
                .unwrap()
                .map(|(k, _)| k),
            Some("a-txo-00000010".to_string())
        );
        assert!(store.scan("z", "a").unwrap().is_empty());
    }

    fn exercise_batch(store: &dyn KeyValueStore) {
        store.put("stale", "x").unwrap();

        let mut batch = WriteBatch::new();
        batch.delete("stale");
        batch.put("spent", "first");
        batch.delete("spent");
        batch.put("spent", "second");
        store.write(batch).unwrap();

        assert_eq!(store.get("stale").unwrap(), None);
        assert_eq!(store.get("spent").unwrap(), Some("second".to_string()));
    }

    #[test]
    fn test_sled_range_ordering() {
        exercise_ordering(&temporary_sled());
    }

    #[test]
    fn test_memory_range_ordering() {
        exercise_ordering(&MemoryStore::new());
    }

    #[test]
    fn test_sled_batch_last_write_wins() {
        exercise_batch(&temporary_sled());
    }

    #[test]
    fn test_memory_batch_last_write_wins() {
        exercise_batch(&MemoryStore::new());
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = temporary_sled();
        assert_eq!(store.get("block-00000001").unwrap(), None);
    }
}
