//! Leadership event streams handed out by [`LeaseHandle::watch`].
//!
//! [`LeaseHandle::watch`]: crate::LeaseHandle::watch

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-subscription event channel.
pub const EVENT_CHANNEL_SIZE: usize = 16;

/// A change in this node's hold on a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeadershipEvent {
    AcquiredLeadership,
    LostLeadership,
}

/// Outcome of waiting on a [`LeaseEvents`] stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchStep {
    /// The backend reported [`LeadershipEvent::AcquiredLeadership`].
    Acquired,
    /// The backend reported [`LeadershipEvent::LostLeadership`].
    Lost,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The backend dropped its end of the stream.
    Closed,
}

/// Receiving end of one watch subscription. Events arrive in the order the
/// backend sent them.
#[derive(Debug)]
pub struct LeaseEvents {
    rx: mpsc::Receiver<LeadershipEvent>,
}

impl LeaseEvents {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (mpsc::Sender<LeadershipEvent>, Self) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        (tx, Self { rx })
    }

    /// Wait for the next event or for `token` to be cancelled, whichever
    /// comes first. Cancellation wins over queued events.
    pub async fn next(&mut self, token: &CancellationToken) -> WatchStep {
        tokio::select! {
            biased;
            _ = token.cancelled() => WatchStep::Cancelled,
            event = self.rx.recv() => match event {
                Some(LeadershipEvent::AcquiredLeadership) => WatchStep::Acquired,
                Some(LeadershipEvent::LostLeadership) => WatchStep::Lost,
                None => WatchStep::Closed,
            },
        }
    }
}

/// Releases a watch subscription. Consumed on use, so it can only run once.
pub struct Unsubscribe(Box<dyn FnOnce() + Send + Sync + 'static>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Unsubscribe by cancelling `token`.
    pub fn from_token(token: CancellationToken) -> Self {
        Self::new(move || token.cancel())
    }

    pub fn unsubscribe(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_in_order() {
        let (tx, mut events) = LeaseEvents::channel();
        let token = CancellationToken::new();
        tx.send(LeadershipEvent::AcquiredLeadership).await.unwrap();
        tx.send(LeadershipEvent::LostLeadership).await.unwrap();

        assert_eq!(events.next(&token).await, WatchStep::Acquired);
        assert_eq!(events.next(&token).await, WatchStep::Lost);
        drop(tx);
        assert_eq!(events.next(&token).await, WatchStep::Closed);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pending_events() {
        let (tx, mut events) = LeaseEvents::channel();
        let token = CancellationToken::new();
        tx.send(LeadershipEvent::AcquiredLeadership).await.unwrap();
        token.cancel();
        assert_eq!(events.next(&token).await, WatchStep::Cancelled);
    }

    #[test]
    fn test_unsubscribe_from_token() {
        let token = CancellationToken::new();
        let unsub = Unsubscribe::from_token(token.clone());
        assert!(!token.is_cancelled());
        unsub.unsubscribe();
        assert!(token.is_cancelled());
    }
}
