//! The managed-component contract.
//!
//! Every long-running piece of a controller process implements [`Component`]
//! and is driven through it by the [`Manager`](crate::Manager).
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Where a component is in its lifecycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    /// constructed, never successfully started
    #[default]
    Uninitialized,
    /// `start` succeeded and `stop` has not been called since
    Running,
    /// `stop` was called after a successful start
    Stopped,
}

impl ComponentState {
    /// is the component currently running?
    pub fn is_running(&self) -> bool {
        matches!(self, ComponentState::Running)
    }
}

/// A unit with an Init/Start/Stop/Reconcile/Healthy lifecycle.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// name used in logs and error context
    fn name(&self) -> &'static str;

    /// one-time setup before the first `start`
    async fn init(&mut self) -> Result<()>;

    /// start the component. Background work must stop when `parent` is
    /// cancelled or when `stop` is called, whichever comes first.
    async fn start(&mut self, parent: &CancellationToken) -> Result<()>;

    /// stop the component and release what `start` acquired. Must be safe to
    /// call repeatedly and before `start`.
    async fn stop(&mut self) -> Result<()>;

    /// re-apply configuration
    async fn reconcile(&mut self) -> Result<()>;

    /// returns an error if the component is unhealthy
    async fn healthy(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_default() {
        assert_eq!(ComponentState::default(), ComponentState::Uninitialized);
        assert!(!ComponentState::Stopped.is_running());
        assert!(ComponentState::Running.is_running());
    }
}
