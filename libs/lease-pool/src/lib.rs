//! # lease-pool
//!
//! Uniquely keyed, continuously renewed leases held in a coordination
//! backend, plus a watch API that reports when this node gains or loses its
//! hold on a lease.
//!
//! The crate is layered the same way for every backend:
//! - a [`ClientFactory`] hands out a backend client,
//! - a [`LeaseBackend`] registers a lease for a key with that client and
//!   returns a [`LeaseHandle`],
//! - [`LeaseHandle::watch`] starts the elector for the key and returns a
//!   [`LeaseEvents`] stream plus an [`Unsubscribe`] that stops it.
//!
//! [`LeasePool`] implements [`LeaseBackend`] for anything implementing the
//! small [`LeaseStore`] trait. Two stores ship here: [`memory::MemoryLeaseStore`]
//! and [`nats::NatsLeaseClient`] (JetStream KV).
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::time::Duration;

use async_trait::async_trait;

mod elector;
pub mod error;
pub mod events;
pub mod memory;
pub mod nats;
pub mod options;
pub mod pool;
pub mod record;

pub use error::{LeasePoolError, LeasePoolResult};
pub use events::{LeadershipEvent, LeaseEvents, Unsubscribe, WatchStep};
pub use memory::{MemoryClientFactory, MemoryLeaseStore};
pub use nats::{NatsClientFactory, NatsConfig, NatsLeaseClient, NatsSecurityMode};
pub use options::LeaseOptions;
pub use pool::{LeasePool, LeasePoolHandle};
pub use record::LeaseRecord;

/// Supplies a client for the coordination backend.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    async fn get_client(&self) -> LeasePoolResult<Self::Client>;
}

/// Registers leases with the coordination backend.
#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Handle: LeaseHandle;

    /// Register a lease under `key`. Registration does not claim the lease;
    /// claiming starts once the handle is watched.
    async fn register_lease(
        &self,
        client: &Self::Client,
        key: &str,
        options: LeaseOptions,
    ) -> LeasePoolResult<Self::Handle>;

    /// Unexpired leases in `namespace` whose key starts with `prefix`.
    async fn active_holders(
        &self,
        client: &Self::Client,
        namespace: &str,
        prefix: &str,
    ) -> LeasePoolResult<Vec<(String, LeaseRecord)>>;
}

/// Ownership record for one registered lease.
#[async_trait]
pub trait LeaseHandle: Send + Sync + 'static {
    fn key(&self) -> &str;

    /// Subscribe to leadership transitions for this lease.
    async fn watch(&self) -> LeasePoolResult<(LeaseEvents, Unsubscribe)>;
}

/// Storage primitive the generic [`LeasePool`] is built on.
///
/// Implementations must make `try_acquire_or_renew` atomic per key: two
/// holders racing for the same free key must not both get `Ok(true)`.
#[async_trait]
pub trait LeaseStore: Clone + Send + Sync + 'static {
    /// Claim or renew `key` for `holder`. `Ok(false)` means another holder's
    /// unexpired record blocks the claim.
    async fn try_acquire_or_renew(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        duration: Duration,
    ) -> LeasePoolResult<bool>;

    /// Drop `key` if `holder` holds it. Returns whether anything was removed.
    async fn release(&self, namespace: &str, key: &str, holder: &str) -> LeasePoolResult<bool>;

    /// Every record in `namespace`, expired or not.
    async fn list(&self, namespace: &str) -> LeasePoolResult<Vec<(String, LeaseRecord)>>;
}

/// Lease keys must be non-empty and limited to `[A-Za-z0-9._-]`, which every
/// backend accepts verbatim.
pub fn validate_key(key: &str) -> LeasePoolResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LeasePoolError::InvalidKey(key.to_owned()))
    }
}
