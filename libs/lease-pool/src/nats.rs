//! NATS JetStream KV lease store with connect backoff and optional
//! auth/encryption.
//!
//! Each lease namespace maps to one KV bucket; each lease key is a KV key
//! holding a JSON [`LeaseRecord`]. Claims use `create` for fresh keys and a
//! revision-checked `update` otherwise, so two holders racing for the same
//! key cannot both win.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_nats::{
    ConnectOptions,
    jetstream::{self, kv},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    ClientFactory, LeaseStore,
    error::{LeasePoolError, LeasePoolResult},
    record::{self, LeaseRecord},
};

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation timeout if not configured.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Base delay for retrying initial NATS connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial NATS connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lease buckets only need the latest value per key.
const LEASE_BUCKET_HISTORY: i64 = 1;

/// How the client authenticates to the NATS servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    CredsFile,
    Tls,
}

impl FromStr for NatsSecurityMode {
    type Err = LeasePoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "user_password" => Ok(Self::UserPassword),
            "token" => Ok(Self::Token),
            "creds_file" => Ok(Self::CredsFile),
            "tls" => Ok(Self::Tls),
            other => Err(LeasePoolError::Config(format!(
                "unknown nats security mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NatsSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::UserPassword => "user_password",
            Self::Token => "token",
            Self::CredsFile => "creds_file",
            Self::Tls => "tls",
        })
    }
}

/// Connection settings for [`NatsLeaseClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub creds_file_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    /// Retries after the first failed connect attempt.
    pub connect_retry_max: u32,
    pub request_timeout: Option<Duration>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".into()],
            security_mode: NatsSecurityMode::None,
            username: None,
            password: None,
            token: None,
            creds_file_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            connect_timeout: None,
            connect_retry_max: 3,
            request_timeout: None,
        }
    }
}

struct ClientInner {
    nats_client: Option<async_nats::Client>,
    config: NatsConfig,
    // bucket name -> opened KV store
    stores: HashMap<String, kv::Store>,
}

/// NATS connection plus cached KV buckets, usable as a [`LeaseStore`].
#[derive(Clone)]
pub struct NatsLeaseClient {
    inner: Arc<RwLock<ClientInner>>,
    request_timeout: Duration,
}

impl NatsLeaseClient {
    /// Create a client without connecting yet. Call [`connect`] before use.
    ///
    /// [`connect`]: NatsLeaseClient::connect
    pub fn new(config: NatsConfig) -> Self {
        let request_timeout = config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            inner: Arc::new(RwLock::new(ClientInner {
                nats_client: None,
                config,
                stores: HashMap::new(),
            })),
            request_timeout,
        }
    }

    /// Build connect options, applying the selected security mode.
    async fn build_connect_options(config: &NatsConfig) -> LeasePoolResult<ConnectOptions> {
        let mut opts = ConnectOptions::new();

        match &config.security_mode {
            NatsSecurityMode::None => {}
            NatsSecurityMode::UserPassword => {
                let user = config.username.as_deref().ok_or_else(|| {
                    LeasePoolError::Config("user_password security mode requires 'username'".into())
                })?;
                let pass = config.password.as_deref().ok_or_else(|| {
                    LeasePoolError::Config("user_password security mode requires 'password'".into())
                })?;
                opts = opts.user_and_password(user.into(), pass.into());
            }
            NatsSecurityMode::Token => {
                let token = config.token.as_deref().ok_or_else(|| {
                    LeasePoolError::Config("token security mode requires 'token'".into())
                })?;
                opts = opts.token(token.into());
            }
            NatsSecurityMode::CredsFile => {
                let creds_path = config.creds_file_path.as_ref().ok_or_else(|| {
                    LeasePoolError::Config(
                        "creds_file security mode requires 'creds_file_path'".into(),
                    )
                })?;
                opts = opts.credentials_file(creds_path).await.map_err(|e| {
                    LeasePoolError::Config(format!(
                        "failed to load credentials file '{}': {e}",
                        creds_path.display()
                    ))
                })?;
            }
            NatsSecurityMode::Tls => {
                let cert_path = config.tls_cert_path.as_ref().ok_or_else(|| {
                    LeasePoolError::Config("tls security mode requires 'tls_cert_path'".into())
                })?;
                let key_path = config.tls_key_path.as_ref().ok_or_else(|| {
                    LeasePoolError::Config("tls security mode requires 'tls_key_path'".into())
                })?;
                opts = opts.add_client_certificate(cert_path.clone(), key_path.clone());
                opts = opts.require_tls(true);
            }
        }

        // server-side TLS verification applies to every auth mode
        if let Some(ca_path) = &config.tls_ca_path {
            opts = opts.add_root_certificates(ca_path.clone());
            opts = opts.require_tls(true);
        }

        let connect_timeout = config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        Ok(opts.connection_timeout(connect_timeout))
    }

    /// Establish the NATS connection, retrying with exponential backoff up to
    /// `connect_retry_max` times.
    pub async fn connect(&self) -> LeasePoolResult<()> {
        let config = {
            let inner = self.inner.read().await;
            if inner.nats_client.is_some() {
                debug!("NATS client already connected, skipping connect");
                return Ok(());
            }
            inner.config.clone()
        };

        info!(
            servers = ?config.servers,
            security_mode = %config.security_mode,
            connect_retry_max = config.connect_retry_max,
            "connecting to NATS"
        );

        let total_attempts = config.connect_retry_max.saturating_add(1);
        let mut attempt = 0;
        loop {
            let opts = Self::build_connect_options(&config).await?;
            let err = match opts.connect(config.servers.clone()).await {
                Ok(client) => {
                    let mut inner = self.inner.write().await;
                    inner.nats_client = Some(client);
                    inner.stores.clear();
                    info!(attempt = attempt + 1, total_attempts, "NATS connection established");
                    return Ok(());
                }
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= total_attempts {
                error!(
                    attempts = total_attempts,
                    error = %err,
                    "NATS connection failed after all retry attempts"
                );
                return Err(LeasePoolError::Transport(format!(
                    "NATS connection failed after {total_attempts} attempt(s): {err}"
                )));
            }

            let delay = CONNECT_RETRY_BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(MAX_CONNECT_RETRY_DELAY);
            warn!(
                attempt,
                total_attempts,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "NATS connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Returns true if the underlying connection is currently up.
    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.read().await;
        inner.nats_client.as_ref().is_some_and(|client| {
            matches!(
                client.connection_state(),
                async_nats::connection::State::Connected
            )
        })
    }

    /// Returns the configured per-operation timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Drop the connection and any cached buckets.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        inner.nats_client = None;
        inner.stores.clear();
        info!("NATS client disconnected");
    }

    async fn nats_client(&self) -> LeasePoolResult<async_nats::Client> {
        let inner = self.inner.read().await;
        inner
            .nats_client
            .clone()
            .ok_or_else(|| LeasePoolError::NotConnected("NATS client not connected".into()))
    }

    /// Open the KV bucket for a lease namespace, creating it if missing.
    async fn kv_store(&self, bucket: &str) -> LeasePoolResult<kv::Store> {
        if let Some(store) = self.inner.read().await.stores.get(bucket) {
            return Ok(store.clone());
        }

        let js = jetstream::new(self.nats_client().await?);
        let store = match js.get_key_value(bucket.to_string()).await {
            Ok(store) => store,
            Err(get_err) => {
                debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: LEASE_BUCKET_HISTORY,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    LeasePoolError::Transport(format!(
                        "failed to create JetStream KV bucket '{bucket}': {create_err} (get error: {get_err})"
                    ))
                })?
            }
        };

        self.inner
            .write()
            .await
            .stores
            .insert(bucket.to_owned(), store.clone());
        Ok(store)
    }

    /// Run a KV operation under the request timeout, mapping failures to
    /// transport errors.
    async fn timed<T, E: fmt::Display>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> LeasePoolResult<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                LeasePoolError::Timeout(format!(
                    "{what} timed out after {:?}",
                    self.request_timeout
                ))
            })?
            .map_err(|e| LeasePoolError::Transport(format!("{what} failed: {e}")))
    }

    /// Write `record` under `key`. Returns `Ok(false)` when another writer
    /// got there first.
    async fn write_record(
        &self,
        store: &kv::Store,
        key: &str,
        record: &LeaseRecord,
        revision: Option<u64>,
    ) -> LeasePoolResult<bool> {
        let payload = record::encode(record)?;
        let timeout = |_: tokio::time::error::Elapsed| {
            LeasePoolError::Timeout(format!(
                "KV write for key '{key}' timed out after {:?}",
                self.request_timeout
            ))
        };
        match revision {
            Some(revision) => {
                match tokio::time::timeout(
                    self.request_timeout,
                    store.update(key, payload.into(), revision),
                )
                .await
                .map_err(timeout)?
                {
                    Ok(_) => Ok(true),
                    Err(err) if matches!(err.kind(), kv::UpdateErrorKind::WrongLastRevision) => {
                        Ok(false)
                    }
                    Err(err) => Err(LeasePoolError::Transport(format!(
                        "KV update failed for key '{key}': {err}"
                    ))),
                }
            }
            None => {
                match tokio::time::timeout(self.request_timeout, store.create(key, payload.into()))
                    .await
                    .map_err(timeout)?
                {
                    Ok(_) => Ok(true),
                    Err(err) if matches!(err.kind(), kv::CreateErrorKind::AlreadyExists) => {
                        Ok(false)
                    }
                    Err(err) => Err(LeasePoolError::Transport(format!(
                        "KV create failed for key '{key}': {err}"
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl LeaseStore for NatsLeaseClient {
    async fn try_acquire_or_renew(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        duration: Duration,
    ) -> LeasePoolResult<bool> {
        let store = self.kv_store(namespace).await?;
        let entry = self
            .timed(
                &format!("KV read for key '{key}'"),
                store.entry(key.to_string()),
            )
            .await?;

        let (existing, revision) = match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                (Some(record::decode(&entry.value)?), Some(entry.revision))
            }
            // deleted or purged: the key is free but updates must still
            // name the tombstone's revision
            Some(entry) => (None, Some(entry.revision)),
            None => (None, None),
        };

        let Some(next) = record::claim(existing.as_ref(), holder, duration, Utc::now()) else {
            return Ok(false);
        };
        let written = self.write_record(&store, key, &next, revision).await?;
        if !written {
            debug!(key, holder, "lost KV revision race for lease");
        }
        Ok(written)
    }

    async fn release(&self, namespace: &str, key: &str, holder: &str) -> LeasePoolResult<bool> {
        let store = self.kv_store(namespace).await?;
        let entry = self
            .timed(
                &format!("KV read for key '{key}'"),
                store.entry(key.to_string()),
            )
            .await?;
        let Some(entry) = entry else {
            return Ok(false);
        };
        let Some(revision) =
            releasable_revision(&entry.operation, &entry.value, entry.revision, holder)?
        else {
            return Ok(false);
        };
        match tokio::time::timeout(
            self.request_timeout,
            store.delete_expect_revision(key, Some(revision)),
        )
        .await
        {
            Err(_) => Err(LeasePoolError::Timeout(format!(
                "KV delete for key '{key}' timed out after {:?}",
                self.request_timeout
            ))),
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) if matches!(err.kind(), kv::DeleteErrorKind::WrongLastRevision) => {
                debug!(key, holder, "lease changed hands before release");
                Ok(false)
            }
            Ok(Err(err)) => Err(LeasePoolError::Transport(format!(
                "KV delete failed for key '{key}': {err}"
            ))),
        }
    }

    async fn list(&self, namespace: &str) -> LeasePoolResult<Vec<(String, LeaseRecord)>> {
        let store = self.kv_store(namespace).await?;
        let mut keys = store.keys().await.map_err(|e| {
            LeasePoolError::Transport(format!("failed to list lease KV keys: {e}"))
        })?;

        let mut records = Vec::new();
        while let Some(key) = keys.try_next().await.map_err(|e| {
            LeasePoolError::Transport(format!("failed reading lease KV keys: {e}"))
        })? {
            let value = self
                .timed(&format!("KV read for key '{key}'"), store.get(key.clone()))
                .await?;
            if let Some(bytes) = value {
                records.push((key, record::decode(&bytes)?));
            }
        }
        Ok(records)
    }
}

/// Revision `holder` may delete, if the stored entry is a live record it
/// holds. Deleting with that revision never removes a newer holder's record.
fn releasable_revision(
    operation: &kv::Operation,
    value: &[u8],
    revision: u64,
    holder: &str,
) -> LeasePoolResult<Option<u64>> {
    if !matches!(operation, kv::Operation::Put) {
        return Ok(None);
    }
    Ok((record::decode(value)?.holder_identity == holder).then_some(revision))
}

impl fmt::Debug for NatsLeaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsLeaseClient")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Connects one [`NatsLeaseClient`] on first use and hands out clones of it.
/// A failed connect leaves nothing cached, so the next call tries again.
#[derive(Debug, Clone)]
pub struct NatsClientFactory {
    config: NatsConfig,
    client: Arc<OnceCell<NatsLeaseClient>>,
}

impl NatsClientFactory {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            client: Arc::new(OnceCell::new()),
        }
    }

    /// The shared client, if a connect has succeeded.
    pub fn connected_client(&self) -> Option<&NatsLeaseClient> {
        self.client.get()
    }
}

#[async_trait]
impl ClientFactory for NatsClientFactory {
    type Client = NatsLeaseClient;

    async fn get_client(&self) -> LeasePoolResult<NatsLeaseClient> {
        self.client
            .get_or_try_init(|| async {
                let client = NatsLeaseClient::new(self.config.clone());
                client.connect().await?;
                Ok::<_, LeasePoolError>(client)
            })
            .await
            .cloned()
    }
}
