//! [`LeaseBackend`] over any [`LeaseStore`].

use std::{fmt, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use crate::{
    LeaseBackend, LeaseHandle, LeaseStore,
    elector::Elector,
    error::{LeasePoolError, LeasePoolResult},
    events::{LeaseEvents, Unsubscribe},
    options::LeaseOptions,
    record::LeaseRecord,
    validate_key,
};

/// Registers leases in a [`LeaseStore`]; the store itself is the client.
pub struct LeasePool<S> {
    _store: PhantomData<fn() -> S>,
}

impl<S> LeasePool<S> {
    pub fn new() -> Self {
        Self {
            _store: PhantomData,
        }
    }
}

impl<S> Default for LeasePool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for LeasePool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasePool").finish()
    }
}

#[async_trait]
impl<S: LeaseStore> LeaseBackend for LeasePool<S> {
    type Client = S;
    type Handle = LeasePoolHandle<S>;

    async fn register_lease(
        &self,
        client: &S,
        key: &str,
        options: LeaseOptions,
    ) -> LeasePoolResult<LeasePoolHandle<S>> {
        validate_key(key)?;
        options.validate()?;
        debug!(
            key,
            holder = %options.holder_identity,
            namespace = %options.namespace,
            "registered lease"
        );
        Ok(LeasePoolHandle {
            store: client.clone(),
            key: key.to_owned(),
            options,
            watching: Arc::new(Mutex::new(None)),
        })
    }

    async fn active_holders(
        &self,
        client: &S,
        namespace: &str,
        prefix: &str,
    ) -> LeasePoolResult<Vec<(String, LeaseRecord)>> {
        let now = Utc::now();
        Ok(client
            .list(namespace)
            .await?
            .into_iter()
            .filter(|(key, record)| key.starts_with(prefix) && !record.is_expired(now))
            .collect())
    }
}

/// Handle for a lease registered through [`LeasePool`]. Dropping the handle
/// stops its elector.
pub struct LeasePoolHandle<S> {
    store: S,
    key: String,
    options: LeaseOptions,
    watching: Arc<Mutex<Option<CancellationToken>>>,
}

impl<S> LeasePoolHandle<S> {
    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }
}

#[async_trait]
impl<S: LeaseStore> LeaseHandle for LeasePoolHandle<S> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn watch(&self) -> LeasePoolResult<(LeaseEvents, Unsubscribe)> {
        let token = {
            let mut watching = self.watching.lock();
            if watching.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return Err(LeasePoolError::AlreadyWatching(self.key.clone()));
            }
            let token = CancellationToken::new();
            *watching = Some(token.clone());
            token
        };

        let (tx, events) = LeaseEvents::channel();
        let elector = Elector::new(
            self.store.clone(),
            self.key.clone(),
            self.options.clone(),
            tx,
        );
        tokio::spawn(elector.run(token.clone()).in_current_span());

        Ok((events, Unsubscribe::from_token(token)))
    }
}

impl<S> Drop for LeasePoolHandle<S> {
    fn drop(&mut self) {
        if let Some(token) = self.watching.lock().take() {
            token.cancel();
        }
    }
}

impl<S> fmt::Debug for LeasePoolHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasePoolHandle")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
