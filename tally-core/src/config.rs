//! controller process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "tally-worker";
    /// default log level. Can use this argument or TALLY_LOG env var
    pub const DEFAULT_TALLY_LOG: &str = "info";
    /// how often (secs) component health is polled for the external api
    pub const DEFAULT_HEALTH_INTERVAL: u64 = 5;
    /// default nats server
    pub static DEFAULT_NATS_SERVERS: &str = "nats://127.0.0.1:4222";
    /// default nats security mode
    pub static DEFAULT_NATS_SECURITY_MODE: &str = "none";
    /// nats connection attempts before giving up
    pub const DEFAULT_NATS_CONNECT_RETRY_MAX: u32 = 3;
    /// timeout (ms) for a single nats KV request
    pub const DEFAULT_NATS_REQUEST_TIMEOUT_MS: u64 = 2_000;
    /// KV bucket / namespace leases are stored in
    pub static DEFAULT_LEASE_NAMESPACE: &str = "node-lease";
    /// lease key prefix, keys are `<prefix>-<node>`
    pub static DEFAULT_LEASE_PREFIX: &str = "tally-ctrl";
    /// seconds a lease is valid without renewal
    pub const DEFAULT_LEASE_DURATION: u64 = 60;
    /// seconds a leader keeps trying to renew before giving up
    pub const DEFAULT_RENEW_DEADLINE: u64 = 15;
    /// seconds between acquire/renew attempts
    pub const DEFAULT_RETRY_PERIOD: u64 = 5;

    use std::{net::SocketAddr, time::Duration};

    pub use clap::Parser;
    use clap::ValueEnum;

    /// where leases are stored
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum Backend {
        /// process-local map, leases are only visible inside this process
        #[default]
        Memory,
        /// NATS JetStream key/value bucket
        Nats,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "tally", bin_name = "tally", about, long_about = None)]
    /// parses from cli & environment var. tally will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// the address the health/metrics api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// seconds between component health polls
        #[clap(
            long,
            env,
            value_parser = clap::value_parser!(u64).range(1..),
            default_value_t = DEFAULT_HEALTH_INTERVAL
        )]
        pub health_interval: u64,
        /// number of tokio worker threads, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_TALLY_LOG)]
        pub tally_log: String,
        /// lease storage backend
        #[clap(long, env, value_enum, default_value_t = Backend::Memory)]
        pub backend: Backend,
        /// comma separated nats server urls
        #[clap(
            long,
            env,
            value_parser,
            value_delimiter = ',',
            default_value = DEFAULT_NATS_SERVERS
        )]
        pub nats_servers: Vec<String>,
        /// nats security mode
        #[clap(
            long,
            env,
            value_parser = ["none", "user_password", "token", "creds_file", "tls"],
            default_value = DEFAULT_NATS_SECURITY_MODE
        )]
        pub nats_security_mode: String,
        /// nats username (user_password mode)
        #[clap(long, env, value_parser)]
        pub nats_user: Option<String>,
        /// nats password (user_password mode)
        #[clap(long, env, value_parser)]
        pub nats_password: Option<String>,
        /// nats token (token mode)
        #[clap(long, env, value_parser)]
        pub nats_token: Option<String>,
        /// path to a nats credentials file (creds_file mode)
        #[clap(long, env, value_parser)]
        pub nats_creds_file: Option<String>,
        /// client certificate (tls mode)
        #[clap(long, env, value_parser)]
        pub nats_tls_cert: Option<String>,
        /// client key (tls mode)
        #[clap(long, env, value_parser)]
        pub nats_tls_key: Option<String>,
        /// root CA (tls mode)
        #[clap(long, env, value_parser)]
        pub nats_tls_ca: Option<String>,
        /// nats connection attempts before giving up
        #[clap(long, env, value_parser, default_value_t = DEFAULT_NATS_CONNECT_RETRY_MAX)]
        pub nats_connect_retry_max: u32,
        /// timeout in milliseconds for a single nats request
        #[clap(long, env, value_parser, default_value_t = DEFAULT_NATS_REQUEST_TIMEOUT_MS)]
        pub nats_request_timeout_ms: u64,
        /// namespace (nats KV bucket) leases are stored in
        #[clap(long, env, value_parser, default_value = DEFAULT_LEASE_NAMESPACE)]
        pub lease_namespace: String,
        /// lease key prefix
        #[clap(long, env, value_parser, default_value = DEFAULT_LEASE_PREFIX)]
        pub lease_prefix: String,
        /// seconds a lease stays valid without renewal
        #[clap(long, env, value_parser, default_value_t = DEFAULT_LEASE_DURATION)]
        pub lease_duration: u64,
        /// seconds the holder keeps retrying renewal before reporting loss
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RENEW_DEADLINE)]
        pub lease_renew_deadline: u64,
        /// seconds between acquire/renew attempts
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RETRY_PERIOD)]
        pub lease_retry_period: u64,
        /// override the host name used as this node's identity
        #[clap(long, env, value_parser)]
        pub node_name: Option<String>,
    }

    impl Config {
        /// health poll interval as `Duration`
        pub fn health_interval(&self) -> Duration {
            Duration::from_secs(self.health_interval)
        }

        /// nats request timeout as `Duration`
        pub fn nats_request_timeout(&self) -> Duration {
            Duration::from_millis(self.nats_request_timeout_ms)
        }

        /// lease duration as `Duration`
        pub fn lease_duration(&self) -> Duration {
            Duration::from_secs(self.lease_duration)
        }

        /// renew deadline as `Duration`
        pub fn lease_renew_deadline(&self) -> Duration {
            Duration::from_secs(self.lease_renew_deadline)
        }

        /// retry period as `Duration`
        pub fn lease_retry_period(&self) -> Duration {
            Duration::from_secs(self.lease_retry_period)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the global subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Level comes from `tally_log`, format
        /// from `LOG_FORMAT`
        pub fn parse(tally_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(tally_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("async_nats=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
