//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, extract::Extension, routing};

use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub use crate::models::{Health, State};

/// Listens for health changes over a channel and reports them, along with
/// process metrics, in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
}

impl ExternalApi {
    /// Create a new ExternalApi instance. Health starts out Bad.
    pub fn new(addr: SocketAddr) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// current health
    pub fn health(&self) -> Health {
        *self.state.lock()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(mut rx: mpsc::Receiver<Health>, state: State) {
        while let Some(health) = rx.recv().await {
            let mut guard = state.lock();
            let prev = *guard;
            if prev != health {
                info!(from = %prev, to = %health, "health changed");
                *guard = health;
            }
        }
        debug!("listen health exited-- nothing sending");
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(addr: SocketAddr, state: State, token: CancellationToken) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(Extension(state));

        debug!(%addr, "external API listening");

        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        debug!("external API shut down");
        Ok(())
    }

    /// Kick off the HTTP service and the health listener. The returned task
    /// ends once `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let Self {
            tx,
            rx,
            addr,
            state,
        } = self;
        // only external senders may keep the listener alive
        drop(tx);
        let listen = tokio::spawn(ExternalApi::listen_status(rx, state.clone()));

        tokio::spawn(async move {
            if let Err(err) = ExternalApi::run(addr, state, token).await {
                error!(?err, "external API returned an error");
            }
            listen.abort();
        })
    }
}

mod handlers {
    use axum::{
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tally_core::metrics::{START_TIME, UPTIME};
    use tracing::error;

    use crate::models::{Health, ServerResult, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match *self {
                Health::Good => "GOOD",
                Health::Bad => "BAD",
            })
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Wraps `anyhow::Error` so handlers can use `?`
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn status(url: &str) -> anyhow::Result<reqwest::StatusCode> {
        Ok(reqwest::get(url).await?.status())
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let api = ExternalApi::new("127.0.0.1:18889".parse()?);
        let tx = api.sender();
        let token = CancellationToken::new();
        let handle = api.start(token.clone());
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;

        // initial health state is BAD i.e. 500
        assert_eq!(
            status("http://127.0.0.1:18889/health").await?,
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );
        tx.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            status("http://127.0.0.1:18889/health").await?,
            reqwest::StatusCode::OK
        );
        assert_eq!(
            status("http://127.0.0.1:18889/ping").await?,
            reqwest::StatusCode::OK
        );

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        Ok(())
    }

    // very simple test for existence of metrics endpoints
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let api = ExternalApi::new("127.0.0.1:18888".parse()?);
        let token = CancellationToken::new();
        let _handle = api.start(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let bytes = reqwest::get("http://127.0.0.1:18888/metrics")
            .await?
            .error_for_status()?
            .bytes()
            .await;
        assert!(bytes.is_ok());

        let text = reqwest::get("http://127.0.0.1:18888/metrics-text")
            .await?
            .error_for_status()?
            .text()
            .await?;
        assert!(text.contains("uptime"));
        token.cancel();
        Ok(())
    }

    #[test]
    fn test_health_serde() {
        assert_eq!(serde_json::to_string(&Health::Good).unwrap(), "\"GOOD\"");
        assert_eq!(Health::Bad.to_string(), "BAD");
    }
}
