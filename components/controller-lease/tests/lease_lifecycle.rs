//! Runs the controller lease through the component contract against a
//! scripted backend.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use controller_lease::{ControllerLeaseConfig, ControllersLeaseCounter, StaticHostname};
use lease_pool::{
    ClientFactory, LeadershipEvent, LeaseBackend, LeaseEvents, LeaseHandle, LeaseOptions,
    LeasePoolError, LeasePoolResult, LeaseRecord, Unsubscribe,
};
use tally_core::{Component, ComponentState};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

#[derive(Debug)]
struct Client;

struct Factory;

#[async_trait]
impl ClientFactory for Factory {
    type Client = Client;

    async fn get_client(&self) -> LeasePoolResult<Client> {
        Ok(Client)
    }
}

/// accepts a single key and emits one acquisition per watch
struct ScriptedBackend {
    expected_key: &'static str,
    unsubscribes: Arc<AtomicUsize>,
}

struct ScriptedHandle {
    key: String,
    unsubscribes: Arc<AtomicUsize>,
}

#[async_trait]
impl LeaseBackend for ScriptedBackend {
    type Client = Client;
    type Handle = ScriptedHandle;

    async fn register_lease(
        &self,
        _client: &Client,
        key: &str,
        options: LeaseOptions,
    ) -> LeasePoolResult<ScriptedHandle> {
        if key != self.expected_key {
            return Err(LeasePoolError::InvalidKey(key.to_owned()));
        }
        assert_eq!(options.holder_identity, "node-a");
        Ok(ScriptedHandle {
            key: key.to_owned(),
            unsubscribes: Arc::clone(&self.unsubscribes),
        })
    }

    async fn active_holders(
        &self,
        _client: &Client,
        _namespace: &str,
        _prefix: &str,
    ) -> LeasePoolResult<Vec<(String, LeaseRecord)>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl LeaseHandle for ScriptedHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn watch(&self) -> LeasePoolResult<(LeaseEvents, Unsubscribe)> {
        let (tx, events) = LeaseEvents::channel();
        tx.send(LeadershipEvent::AcquiredLeadership)
            .await
            .map_err(|err| LeasePoolError::Transport(err.to_string()))?;
        // keep the stream open until unsubscribed
        let unsubscribes = Arc::clone(&self.unsubscribes);
        Ok((
            events,
            Unsubscribe::new(move || {
                drop(tx);
                unsubscribes.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }
}

#[tokio::test]
#[traced_test]
async fn acquired_event_logged_and_stop_unsubscribes_once() {
    let unsubscribes = Arc::new(AtomicUsize::new(0));
    let mut component = ControllersLeaseCounter::with_hostname(
        Factory,
        ScriptedBackend {
            expected_key: "prefix-node-a",
            unsubscribes: Arc::clone(&unsubscribes),
        },
        ControllerLeaseConfig::new("prefix", LeaseOptions::new(String::new())),
        StaticHostname::new("Node-A"),
    );
    let token = CancellationToken::new();

    Component::init(&mut component).await.unwrap();
    Component::start(&mut component, &token).await.unwrap();
    assert!(component.lease_registered());
    assert_eq!(component.key(), Some("prefix-node-a"));

    tokio::time::timeout(Duration::from_secs(2), async {
        while !logs_contain("acquired leader lease") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("acquired transition never logged");

    assert!(Component::stop(&mut component).await.is_ok());
    assert!(Component::stop(&mut component).await.is_ok());
    assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
    assert_eq!(component.state(), ComponentState::Stopped);
    assert_eq!(component.last_report().map(|r| r.acquired), Some(1));
    assert!(logs_contain("controller lease released"));
}
