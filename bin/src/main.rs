#![allow(clippy::cognitive_complexity)]
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

mod startup_health;

use controller_lease::{ControllerLeaseConfig, ControllersLeaseCounter, StaticHostname};
use external_api::{ExternalApi, Health};
use lease_pool::{
    ClientFactory, LeaseBackend, LeaseOptions, LeasePool, MemoryClientFactory, MemoryLeaseStore,
    NatsClientFactory, NatsConfig, NatsLeaseClient, NatsSecurityMode,
};
use startup_health::verify_background_task_running;
use tally_core::{
    Manager,
    config::{
        cli::{self, Backend, Parser},
        trace,
    },
    tracing::*,
};
use tokio::{runtime::Builder, signal};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // .env must be loaded before clap reads env vars
    let dotenv_res = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.tally_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv_res {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let lease_config = lease_config(&config);
    info!(
        backend = ?config.backend,
        key_prefix = %lease_config.key_prefix,
        namespace = %lease_config.options.namespace,
        "lease settings"
    );

    let mut manager = Manager::new();
    match config.backend {
        Backend::Memory => {
            warn!("memory backend: leases are only visible inside this process");
            manager.add(controller_lease(
                MemoryClientFactory::new(MemoryLeaseStore::new()),
                LeasePool::<MemoryLeaseStore>::new(),
                lease_config,
                config.node_name.as_deref(),
            ));
        }
        Backend::Nats => {
            let nats_config = nats_config(&config)?;
            info!(
                servers = ?nats_config.servers,
                mode = %nats_config.security_mode,
                "using nats lease backend"
            );
            manager.add(controller_lease(
                NatsClientFactory::new(nats_config),
                LeasePool::<NatsLeaseClient>::new(),
                lease_config,
                config.node_name.as_deref(),
            ));
        }
    }

    let token = CancellationToken::new();
    // start external api for healthchecks
    let api = ExternalApi::new(config.external_api);
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());
    verify_background_task_running("external API", &mut api_task).await?;

    manager.init().await?;
    if let Err(err) = manager.start(&token).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }
    tokio::spawn(shutdown_signal(token.clone()));

    let mut ticker = tokio::time::interval(config.health_interval());
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let health = match manager.healthy().await {
                    Ok(()) => Health::Good,
                    Err(err) => {
                        warn!(?err, "health check failed");
                        Health::Bad
                    }
                };
                api_sender
                    .send(health)
                    .await
                    .context("error occurred in changing health status")?;
            }
        }
    }

    let _ = api_sender.send(Health::Bad).await;
    manager.stop().await;
    if let Err(err) = api_task.await {
        error!(?err, "error waiting for web server API");
    }
    Ok(())
}

fn controller_lease<F, B>(
    factory: F,
    backend: B,
    config: ControllerLeaseConfig,
    node_name: Option<&str>,
) -> ControllersLeaseCounter<F, B>
where
    F: ClientFactory,
    B: LeaseBackend<Client = F::Client>,
{
    match node_name {
        Some(name) => {
            info!(%name, "using configured node name");
            ControllersLeaseCounter::with_hostname(
                factory,
                backend,
                config,
                StaticHostname::new(name),
            )
        }
        None => ControllersLeaseCounter::new(factory, backend, config),
    }
}

fn lease_config(config: &cli::Config) -> ControllerLeaseConfig {
    ControllerLeaseConfig::new(
        config.lease_prefix.clone(),
        // holder is filled in from the node identity on start
        LeaseOptions::new(String::new())
            .with_namespace(config.lease_namespace.clone())
            .with_lease_duration(config.lease_duration())
            .with_renew_deadline(config.lease_renew_deadline())
            .with_retry_period(config.lease_retry_period()),
    )
}

fn nats_config(config: &cli::Config) -> Result<NatsConfig> {
    let security_mode: NatsSecurityMode = config
        .nats_security_mode
        .parse()
        .context("invalid nats security mode")?;
    Ok(NatsConfig {
        servers: config.nats_servers.clone(),
        security_mode,
        username: config.nats_user.clone(),
        password: config.nats_password.clone(),
        token: config.nats_token.clone(),
        creds_file_path: config.nats_creds_file.as_ref().map(PathBuf::from),
        tls_cert_path: config.nats_tls_cert.as_ref().map(PathBuf::from),
        tls_key_path: config.nats_tls_key.as_ref().map(PathBuf::from),
        tls_ca_path: config.nats_tls_ca.as_ref().map(PathBuf::from),
        connect_retry_max: config.nats_connect_retry_max,
        request_timeout: Some(config.nats_request_timeout()),
        ..NatsConfig::default()
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_lease_config_from_cli() {
        let cfg = cli::Config::parse_from([
            "tally",
            "--lease-prefix",
            "ctrl",
            "--lease-namespace",
            "cluster-a",
            "--lease-retry-period",
            "2",
        ]);
        let lease = lease_config(&cfg);
        assert_eq!(lease.key_prefix, "ctrl");
        assert_eq!(lease.options.namespace, "cluster-a");
        assert_eq!(lease.options.retry_period, Duration::from_secs(2));
        assert_eq!(lease.options.lease_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_nats_config_from_cli() -> Result<()> {
        let cfg = cli::Config::parse_from([
            "tally",
            "--backend",
            "nats",
            "--nats-security-mode",
            "creds_file",
            "--nats-creds-file",
            "/etc/tally/nats.creds",
        ]);
        let nats = nats_config(&cfg)?;
        assert_eq!(nats.security_mode, NatsSecurityMode::CredsFile);
        assert_eq!(
            nats.creds_file_path,
            Some(PathBuf::from("/etc/tally/nats.creds"))
        );
        assert_eq!(nats.request_timeout, Some(Duration::from_secs(2)));
        Ok(())
    }
}
