//! Process-local lease store. Every clone shares the same map, so several
//! handles (or several simulated nodes) can contend for keys in one process.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    ClientFactory, LeaseStore,
    error::LeasePoolResult,
    record::{self, LeaseRecord},
};

#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    // (namespace, key) -> record
    inner: Arc<Mutex<BTreeMap<(String, String), LeaseRecord>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for `key`, expired or not.
    pub fn get(&self, namespace: &str, key: &str) -> Option<LeaseRecord> {
        self.inner
            .lock()
            .get(&(namespace.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Store a record as-is, bypassing the claim rule.
    pub fn insert(&self, namespace: &str, key: &str, record: LeaseRecord) {
        self.inner
            .lock()
            .insert((namespace.to_owned(), key.to_owned()), record);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire_or_renew(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        duration: Duration,
    ) -> LeasePoolResult<bool> {
        let mut guard = self.inner.lock();
        let slot = (namespace.to_owned(), key.to_owned());
        match record::claim(guard.get(&slot), holder, duration, Utc::now()) {
            Some(next) => {
                trace!(key, holder, renew_time = %next.renew_time, "memory lease written");
                guard.insert(slot, next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, namespace: &str, key: &str, holder: &str) -> LeasePoolResult<bool> {
        let mut guard = self.inner.lock();
        let slot = (namespace.to_owned(), key.to_owned());
        if guard
            .get(&slot)
            .is_some_and(|current| current.holder_identity == holder)
        {
            guard.remove(&slot);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list(&self, namespace: &str) -> LeasePoolResult<Vec<(String, LeaseRecord)>> {
        Ok(self
            .inner
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), record)| (key.clone(), record.clone()))
            .collect())
    }
}

/// Hands out clones of one shared [`MemoryLeaseStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryClientFactory {
    store: MemoryLeaseStore,
}

impl MemoryClientFactory {
    pub fn new(store: MemoryLeaseStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryLeaseStore {
        &self.store
    }
}

#[async_trait]
impl ClientFactory for MemoryClientFactory {
    type Client = MemoryLeaseStore;

    async fn get_client(&self) -> LeasePoolResult<MemoryLeaseStore> {
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "node-lease";
    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_acquire_renew_and_deny() {
        let store = MemoryLeaseStore::new();
        assert!(store.try_acquire_or_renew(NS, "k", "a", MINUTE).await.unwrap());
        assert!(store.try_acquire_or_renew(NS, "k", "a", MINUTE).await.unwrap());
        assert!(!store.try_acquire_or_renew(NS, "k", "b", MINUTE).await.unwrap());
        // same key in another namespace is independent
        assert!(store.try_acquire_or_renew("other", "k", "b", MINUTE).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_taken_over() {
        let store = MemoryLeaseStore::new();
        let stale = LeaseRecord::new("a", MINUTE, Utc::now() - chrono::Duration::minutes(5));
        store.insert(NS, "k", stale);

        assert!(store.try_acquire_or_renew(NS, "k", "b", MINUTE).await.unwrap());
        let record = store.get(NS, "k").unwrap();
        assert_eq!(record.holder_identity, "b");
        assert_eq!(record.lease_transitions, 1);
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryLeaseStore::new();
        store.try_acquire_or_renew(NS, "k", "a", MINUTE).await.unwrap();
        assert!(!store.release(NS, "k", "b").await.unwrap());
        assert!(store.get(NS, "k").is_some());
        assert!(store.release(NS, "k", "a").await.unwrap());
        assert!(store.get(NS, "k").is_none());
        assert!(!store.release(NS, "k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_factory_shares_store() {
        let factory = MemoryClientFactory::default();
        let client = factory.get_client().await.unwrap();
        client.try_acquire_or_renew(NS, "k", "a", MINUTE).await.unwrap();
        assert_eq!(factory.store().list(NS).await.unwrap().len(), 1);
    }
}
