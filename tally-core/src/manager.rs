//! Drives a list of [`Component`]s through their lifecycle in order.
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{component::Component, metrics::RUNNING_COMPONENTS};

/// Starts components in the order they were added and stops them in reverse.
#[derive(Default)]
pub struct Manager {
    components: Vec<Box<dyn Component>>,
    // components[..started] are running
    started: usize,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field(
                "components",
                &self.components.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("started", &self.started)
            .finish()
    }
}

impl Manager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// add a component, it will be started after the ones already added
    pub fn add<C: Component>(&mut self, component: C) -> &mut Self {
        self.components.push(Box::new(component));
        self
    }

    /// number of components currently running
    pub fn started(&self) -> usize {
        self.started
    }

    /// init every component in order, stopping at the first failure
    pub async fn init(&mut self) -> Result<()> {
        for component in self.components.iter_mut() {
            let name = component.name();
            debug!(component = name, "initializing component");
            component
                .init()
                .await
                .with_context(|| format!("failed to initialize component {name}"))?;
        }
        Ok(())
    }

    /// start every component in order. If one fails, the ones already started
    /// are stopped in reverse order before the error is returned.
    pub async fn start(&mut self, token: &CancellationToken) -> Result<()> {
        while self.started < self.components.len() {
            let component = &mut self.components[self.started];
            let name = component.name();
            info!(component = name, "starting component");
            if let Err(err) = component.start(token).await {
                error!(?err, component = name, "component failed to start");
                // the failed component may hold partial state
                if let Err(stop_err) = component.stop().await {
                    error!(?stop_err, component = name, "error stopping failed component");
                }
                self.stop().await;
                return Err(err).with_context(|| format!("failed to start component {name}"));
            }
            self.started += 1;
            RUNNING_COMPONENTS.inc();
        }
        Ok(())
    }

    /// stop running components in reverse order. Errors are logged, never
    /// returned, so one component cannot block shutdown of the others.
    pub async fn stop(&mut self) {
        while self.started > 0 {
            self.started -= 1;
            RUNNING_COMPONENTS.dec();
            let component = &mut self.components[self.started];
            let name = component.name();
            info!(component = name, "stopping component");
            if let Err(err) = component.stop().await {
                error!(?err, component = name, "error stopping component");
            }
        }
    }

    /// reconcile every running component
    pub async fn reconcile(&mut self) -> Result<()> {
        for component in self.components[..self.started].iter_mut() {
            let name = component.name();
            component
                .reconcile()
                .await
                .with_context(|| format!("failed to reconcile component {name}"))?;
        }
        Ok(())
    }

    /// health check every running component, reporting the first failure
    pub async fn healthy(&self) -> Result<()> {
        for component in self.components[..self.started].iter() {
            let name = component.name();
            component
                .healthy()
                .await
                .with_context(|| format!("component {name} is unhealthy"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        calls: Calls,
        fail_start: bool,
        unhealthy: bool,
    }

    impl Recorder {
        fn new(name: &'static str, calls: &Calls) -> Self {
            Self {
                name,
                calls: Arc::clone(calls),
                fail_start: false,
                unhealthy: false,
            }
        }

        fn record(&self, call: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{call}", self.name));
        }
    }

    #[async_trait]
    impl Component for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&mut self) -> Result<()> {
            self.record("init");
            Ok(())
        }

        async fn start(&mut self, _parent: &CancellationToken) -> Result<()> {
            self.record("start");
            if self.fail_start {
                bail!("boom");
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        async fn reconcile(&mut self) -> Result<()> {
            self.record("reconcile");
            Ok(())
        }

        async fn healthy(&self) -> Result<()> {
            if self.unhealthy {
                bail!("not ok");
            }
            Ok(())
        }
    }

    fn calls(calls: &Calls) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_start_stop_order() -> Result<()> {
        let log = Calls::default();
        let mut mgr = Manager::new();
        mgr.add(Recorder::new("a", &log))
            .add(Recorder::new("b", &log));
        mgr.init().await?;
        mgr.start(&CancellationToken::new()).await?;
        assert_eq!(mgr.started(), 2);
        mgr.reconcile().await?;
        mgr.stop().await;
        // second stop is a no-op
        mgr.stop().await;

        assert_eq!(
            calls(&log),
            vec![
                "a:init",
                "b:init",
                "a:start",
                "b:start",
                "a:reconcile",
                "b:reconcile",
                "b:stop",
                "a:stop"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_start_unwinds() {
        let log = Calls::default();
        let mut failing = Recorder::new("b", &log);
        failing.fail_start = true;
        let mut mgr = Manager::new();
        mgr.add(Recorder::new("a", &log))
            .add(failing)
            .add(Recorder::new("c", &log));

        let err = mgr.start(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("failed to start component b"));
        assert_eq!(mgr.started(), 0);
        assert_eq!(calls(&log), vec!["a:start", "b:start", "b:stop", "a:stop"]);
        assert!(logs_contain("component failed to start"));
    }

    #[tokio::test]
    async fn test_healthy_names_component() -> Result<()> {
        let log = Calls::default();
        let mut sick = Recorder::new("sick", &log);
        sick.unhealthy = true;
        let mut mgr = Manager::new();
        mgr.add(Recorder::new("fine", &log)).add(sick);

        // nothing running yet, nothing to report
        assert!(mgr.healthy().await.is_ok());
        mgr.start(&CancellationToken::new()).await?;
        let err = mgr.healthy().await.unwrap_err();
        assert!(err.to_string().contains("component sick is unhealthy"));
        mgr.stop().await;
        Ok(())
    }
}
