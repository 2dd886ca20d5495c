//! Per-prefix sequence counters.
//!
//! The first allocation for a prefix looks at the store to find where the
//! prefix left off; later allocations are purely in memory. Numbers are never
//! handed out twice within a process, even after the records that used them
//! are deleted.

use crate::error::StorageError;
use crate::schema;
use crate::storage::KeyValueStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

pub struct SequenceCache {
    store: Arc<dyn KeyValueStore>,
    /// Last number handed out per prefix. Holding an entry locks its shard,
    /// which serialises allocation on the same prefix.
    last: DashMap<String, u64>,
}

impl SequenceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            last: DashMap::new(),
        }
    }

    /// Allocate the next sequence number for `prefix`.
    pub fn next(&self, prefix: &str) -> Result<u64, StorageError> {
        let next = match self.last.entry(prefix.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = *entry.get() + 1;
                if next >= schema::MAX_SEQUENCE {
                    return Err(StorageError::SequenceExhausted {
                        prefix: prefix.to_string(),
                    });
                }
                *entry.get_mut() = next;
                next
            }
            Entry::Vacant(entry) => {
                let next = self.bootstrap(prefix)?;
                entry.insert(next);
                next
            }
        };
        Ok(next)
    }

    /// `count + 1` over the prefix range. When earlier records were deleted the
    /// range has gaps, so the highest number present bounds the result from
    /// below to keep surviving keys from being overwritten after a restart.
    fn bootstrap(&self, prefix: &str) -> Result<u64, StorageError> {
        let (start, limit) = schema::sequence_range(prefix);
        let count = self.store.count(&start, &limit)? as u64;
        let highest = self
            .store
            .last_in_range(&start, &limit)?
            .and_then(|(key, _)| schema::sequence_of(&key))
            .unwrap_or(0);
        let next = count.max(highest) + 1;
        if next >= schema::MAX_SEQUENCE {
            return Err(StorageError::SequenceExhausted {
                prefix: prefix.to_string(),
            });
        }
        tracing::debug!("Sequence for {} bootstrapped at {}", prefix, next);
        Ok(next)
    }

    /// Number of prefixes currently cached.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
