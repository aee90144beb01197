use crate::application_port::QueryCache;
use dashmap::DashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    entries: DashMap<String, serde_json::Value>,
    epoch: Mutex<u64>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // held across check-and-insert so a concurrent clear cannot interleave
    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        match self.epoch.lock() {
            Ok(epoch) => epoch,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl QueryCache for MemoryQueryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: &str, value: serde_json::Value) {
        self.entries.insert(key.to_owned(), value);
    }

    fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    fn put_in_epoch(&self, key: &str, value: serde_json::Value, epoch: u64) -> bool {
        let current = self.lock_epoch();
        if *current != epoch {
            return false;
        }
        self.entries.insert(key.to_owned(), value);
        true
    }

    fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&self) {
        let mut epoch = self.lock_epoch();
        *epoch += 1;
        self.entries.clear();
    }
}
