//! In-memory partition backend.
//!
//! Entries live in one `DashMap` per partition so per-key reads and writes
//! are atomic without a global lock. The partition list itself sits behind
//! an `RwLock` to preserve creation order.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use super::keys::RequestKey;
use super::lock::{read_or_recover, write_or_recover};
use super::store::{StoreBackend, StoreError, StoredResponse};

type Entries = Arc<DashMap<RequestKey, StoredResponse>>;

/// Non-persistent backend, used by tests and the `memory` storage setting.
#[derive(Default)]
pub struct MemoryBackend {
    partitions: RwLock<Vec<(String, Entries)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, partition: &str) -> Option<Entries> {
        read_or_recover(&self.partitions, "cache::memory::find")
            .iter()
            .find(|(name, _)| name == partition)
            .map(|(_, entries)| entries.clone())
    }

    fn find_or_create(&self, partition: &str) -> Entries {
        if let Some(entries) = self.find(partition) {
            return entries;
        }
        let mut partitions = write_or_recover(&self.partitions, "cache::memory::create");
        if let Some((_, entries)) = partitions.iter().find(|(name, _)| name == partition) {
            return entries.clone();
        }
        let entries: Entries = Arc::new(DashMap::new());
        partitions.push((partition.to_string(), entries.clone()));
        entries
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        self.find_or_create(partition);
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        Ok(read_or_recover(&self.partitions, "cache::memory::partitions")
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError> {
        Ok(self
            .find(partition)
            .and_then(|entries| entries.get(key).map(|entry| entry.value().clone())))
    }

    async fn put(
        &self,
        partition: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError> {
        self.find_or_create(partition).insert(key.clone(), response);
        Ok(())
    }

    async fn delete(&self, partition: &str) -> Result<bool, StoreError> {
        let mut partitions = write_or_recover(&self.partitions, "cache::memory::delete");
        let before = partitions.len();
        partitions.retain(|(name, _)| name != partition);
        Ok(partitions.len() != before)
    }

    async fn len(&self, partition: &str) -> Result<usize, StoreError> {
        Ok(self.find(partition).map_or(0, |entries| entries.len()))
    }
}
