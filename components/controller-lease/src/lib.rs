#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]
//! # controller-lease
//!
//! Every controller node keeps one lease, keyed `<prefix>-<node identity>`,
//! registered and renewed in the coordination backend for as long as the
//! component runs. Counting the unexpired leases under the prefix tells the
//! cluster how many controllers are alive.

use std::fmt;

use lease_pool::{
    ClientFactory, LeaseBackend, LeaseHandle, LeaseOptions, options::DEFAULT_NAMESPACE,
};
use tally_core::{prelude::*, tokio::task::JoinHandle, tracing::Instrument};

pub mod error;
pub mod identity;
pub mod metrics;
mod watch;

pub use error::ControllerLeaseError;
pub use identity::{HostnameSource, IdentityError, NodeIdentity, StaticHostname, SystemHostname};
pub use watch::WatchReport;

/// default lease key prefix
pub const DEFAULT_KEY_PREFIX: &str = "tally-ctrl";

/// Settings for the controller's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerLeaseConfig {
    /// leases are keyed `<key_prefix>-<node identity>`
    pub key_prefix: String,
    /// timings and namespace. `holder_identity` is replaced with the node
    /// identity on every start.
    pub options: LeaseOptions,
}

impl Default for ControllerLeaseConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            options: LeaseOptions::new(String::new()).with_namespace(DEFAULT_NAMESPACE),
        }
    }
}

impl ControllerLeaseConfig {
    pub fn new(key_prefix: impl Into<String>, options: LeaseOptions) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            options,
        }
    }

    /// `<prefix>-<identity>`
    pub fn lease_key(&self, identity: &NodeIdentity) -> String {
        format!("{}-{}", self.key_prefix, identity)
    }

    /// prefix every controller lease key starts with
    pub fn key_scope(&self) -> String {
        format!("{}-", self.key_prefix)
    }
}

/// How a successful start went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// the lease is registered and watched
    Registered,
    /// running, but no lease was registered because the node has no usable
    /// identity
    Degraded(IdentityError),
}

impl StartOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, StartOutcome::Registered)
    }
}

/// Everything acquired by one successful registration. Dropped on stop.
struct LeaseRun<H> {
    key: String,
    // dropped after the watch task has exited
    handle: H,
    // owns the subscription and releases it on exit
    task: JoinHandle<WatchReport>,
}

/// Publishes this node's presence lease and watches it.
pub struct ControllersLeaseCounter<F, B>
where
    F: ClientFactory,
    B: LeaseBackend<Client = F::Client>,
{
    factory: F,
    backend: B,
    hostname: Box<dyn HostnameSource>,
    config: ControllerLeaseConfig,
    state: ComponentState,
    token: Option<CancellationToken>,
    run: Option<LeaseRun<B::Handle>>,
    last_report: Option<WatchReport>,
}

impl<F, B> fmt::Debug for ControllersLeaseCounter<F, B>
where
    F: ClientFactory,
    B: LeaseBackend<Client = F::Client>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllersLeaseCounter")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

impl<F, B> ControllersLeaseCounter<F, B>
where
    F: ClientFactory,
    B: LeaseBackend<Client = F::Client>,
{
    /// Counter reading the identity from the OS host name
    pub fn new(factory: F, backend: B, config: ControllerLeaseConfig) -> Self {
        Self::with_hostname(factory, backend, config, SystemHostname)
    }

    pub fn with_hostname<H: HostnameSource>(
        factory: F,
        backend: B,
        config: ControllerLeaseConfig,
        hostname: H,
    ) -> Self {
        Self {
            factory,
            backend,
            hostname: Box::new(hostname),
            config,
            state: ComponentState::Uninitialized,
            token: None,
            run: None,
            last_report: None,
        }
    }

    pub fn config(&self) -> &ControllerLeaseConfig {
        &self.config
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// is a lease currently registered and watched?
    pub fn lease_registered(&self) -> bool {
        self.run.is_some()
    }

    /// key of the registered lease, if any
    pub fn key(&self) -> Option<&str> {
        self.run.as_ref().map(|run| run.key.as_str())
    }

    /// what the last stopped watch loop observed
    pub fn last_report(&self) -> Option<WatchReport> {
        self.last_report
    }

    /// A backend client from the injected factory.
    pub async fn acquire_client(&self) -> Result<F::Client, ControllerLeaseError> {
        self.factory
            .get_client()
            .await
            .map_err(ControllerLeaseError::ClientUnavailable)
    }

    /// Register and watch this node's lease. Calling it while running stops
    /// the previous run first.
    ///
    /// An unresolvable identity is not an error: the component runs with no
    /// lease and the outcome is [`StartOutcome::Degraded`].
    pub async fn start(
        &mut self,
        parent: &CancellationToken,
    ) -> Result<StartOutcome, ControllerLeaseError> {
        if self.state.is_running() {
            info!("controller lease already running, restarting");
            self.stop().await;
        }
        let token = parent.child_token();

        let identity = match identity::resolve_identity(self.hostname.as_ref()) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, "unable to resolve node identity, running without a controller lease");
                metrics::START_DEGRADED.inc();
                self.token = Some(token);
                self.state = ComponentState::Running;
                return Ok(StartOutcome::Degraded(err));
            }
        };

        let client = self.acquire_client().await?;

        let key = self.config.lease_key(&identity);
        let options = self
            .config
            .options
            .clone()
            .with_holder_identity(identity.as_str());
        let handle = self
            .backend
            .register_lease(&client, &key, options)
            .await
            .map_err(|source| ControllerLeaseError::LeaseRegistrationFailed {
                key: key.clone(),
                source,
            })?;
        // a failed watch drops `handle`, which releases the registration
        let (events, unsubscribe) =
            handle
                .watch()
                .await
                .map_err(|source| ControllerLeaseError::WatchSubscriptionFailed {
                    key: key.clone(),
                    source,
                })?;

        let task = tokio::spawn(
            watch::watch_loop(key.clone(), events, unsubscribe, token.clone()).in_current_span(),
        );
        info!(%key, %identity, "controller lease registered");

        self.run = Some(LeaseRun { key, handle, task });
        self.token = Some(token);
        self.state = ComponentState::Running;
        Ok(StartOutcome::Registered)
    }

    /// Release whatever the last start acquired and wait for the watch loop
    /// to exit. Safe to call repeatedly and before start.
    ///
    /// Cancelling the parent token passed to [`start`] releases the
    /// subscription on its own; `stop` then only reaps the finished loop.
    ///
    /// [`start`]: ControllersLeaseCounter::start
    pub async fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(LeaseRun { key, handle, task }) = self.run.take() {
            match task.await {
                Ok(report) => {
                    debug!(%key, ?report, "lease watch exited");
                    self.last_report = Some(report);
                }
                Err(err) => error!(?err, %key, "lease watch task failed"),
            }
            drop(handle);
            info!(%key, "controller lease released");
        }
        if self.state.is_running() {
            self.state = ComponentState::Stopped;
        }
    }

    /// Number of controllers currently holding an unexpired lease under the
    /// configured prefix, this node included.
    pub async fn active_controllers(&self) -> Result<usize, ControllerLeaseError> {
        let client = self.acquire_client().await?;
        let holders = self
            .backend
            .active_holders(
                &client,
                &self.config.options.namespace,
                &self.config.key_scope(),
            )
            .await
            .map_err(ControllerLeaseError::Query)?;
        trace!(?holders, "active controller leases");
        Ok(holders.len())
    }
}

#[async_trait]
impl<F, B> Component for ControllersLeaseCounter<F, B>
where
    F: ClientFactory,
    B: LeaseBackend<Client = F::Client>,
{
    fn name(&self) -> &'static str {
        "controller-lease"
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        ControllersLeaseCounter::start(self, parent).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        ControllersLeaseCounter::stop(self).await;
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        debug!(key = ?self.key(), "reconcile called, nothing to do");
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        Ok(())
    }
}
