//! Background acquire/renew loop behind a watched lease.

use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{LeaseStore, error::LeasePoolResult, events::LeadershipEvent, options::LeaseOptions};

pub(crate) struct Elector<S> {
    store: S,
    key: String,
    options: LeaseOptions,
    tx: mpsc::Sender<LeadershipEvent>,
    leading: bool,
    last_renew: Option<Instant>,
}

impl<S: LeaseStore> Elector<S> {
    pub(crate) fn new(
        store: S,
        key: String,
        options: LeaseOptions,
        tx: mpsc::Sender<LeadershipEvent>,
    ) -> Self {
        Self {
            store,
            key,
            options,
            tx,
            leading: false,
            last_renew: None,
        }
    }

    /// Attempt a claim every retry period until `token` is cancelled or the
    /// watcher goes away. The lease is released on the way out if held.
    pub(crate) async fn run(mut self, token: CancellationToken) {
        let mut ticker = time::interval(self.options.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(key = %self.key, holder = %self.options.holder_identity, "lease elector started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let result = self
                        .store
                        .try_acquire_or_renew(
                            &self.options.namespace,
                            &self.key,
                            &self.options.holder_identity,
                            self.options.lease_duration,
                        )
                        .await;
                    let Some(event) = self.observe(result, Instant::now()) else {
                        continue;
                    };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        sent = self.tx.send(event) => {
                            if sent.is_err() {
                                debug!(key = %self.key, "lease watcher dropped, stopping elector");
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.release().await;
        debug!(key = %self.key, "lease elector stopped");
    }

    /// Fold one attempt result into the leadership state and return the
    /// transition it caused, if any.
    fn observe(&mut self, result: LeasePoolResult<bool>, now: Instant) -> Option<LeadershipEvent> {
        match result {
            Ok(true) => {
                self.last_renew = Some(now);
                if self.leading {
                    None
                } else {
                    self.leading = true;
                    info!(key = %self.key, "lease acquired");
                    Some(LeadershipEvent::AcquiredLeadership)
                }
            }
            Ok(false) => {
                if self.leading {
                    self.leading = false;
                    warn!(key = %self.key, "lease taken by another holder");
                    Some(LeadershipEvent::LostLeadership)
                } else {
                    None
                }
            }
            Err(err) if !err.is_retryable() => {
                error!(?err, key = %self.key, "lease acquire/renew failed and will not succeed on retry");
                self.step_down()
            }
            Err(err) => {
                warn!(?err, key = %self.key, "lease acquire/renew attempt failed");
                let past_deadline = self
                    .last_renew
                    .is_none_or(|at| now.duration_since(at) >= self.options.renew_deadline);
                if past_deadline {
                    self.step_down()
                } else {
                    None
                }
            }
        }
    }

    fn step_down(&mut self) -> Option<LeadershipEvent> {
        if !self.leading {
            return None;
        }
        self.leading = false;
        warn!(key = %self.key, "giving up lease leadership");
        Some(LeadershipEvent::LostLeadership)
    }

    async fn release(&mut self) {
        if !self.leading {
            return;
        }
        self.leading = false;
        match self
            .store
            .release(
                &self.options.namespace,
                &self.key,
                &self.options.holder_identity,
            )
            .await
        {
            Ok(released) => debug!(key = %self.key, released, "lease released"),
            Err(err) => warn!(?err, key = %self.key, "failed to release lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{error::LeasePoolError, memory::MemoryLeaseStore};

    use super::*;

    fn elector() -> (Elector<MemoryLeaseStore>, mpsc::Receiver<LeadershipEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let options = LeaseOptions::new("node-a");
        (
            Elector::new(MemoryLeaseStore::new(), "k".into(), options, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_observe_transitions_once() {
        let (mut elector, _rx) = elector();
        let now = Instant::now();
        assert_eq!(
            elector.observe(Ok(true), now),
            Some(LeadershipEvent::AcquiredLeadership)
        );
        assert_eq!(elector.observe(Ok(true), now), None);
        assert_eq!(
            elector.observe(Ok(false), now),
            Some(LeadershipEvent::LostLeadership)
        );
        assert_eq!(elector.observe(Ok(false), now), None);
    }

    #[tokio::test]
    async fn test_observe_errors_respect_renew_deadline() {
        let (mut elector, _rx) = elector();
        let start = Instant::now();
        elector.observe(Ok(true), start);

        let err = || Err(LeasePoolError::Transport("down".into()));
        assert_eq!(elector.observe(err(), start + Duration::from_secs(5)), None);
        assert_eq!(
            elector.observe(err(), start + Duration::from_secs(15)),
            Some(LeadershipEvent::LostLeadership)
        );
        // not leading any more, nothing further to report
        assert_eq!(elector.observe(err(), start + Duration::from_secs(20)), None);
    }

    #[tokio::test]
    async fn test_observe_fatal_error_steps_down_at_once() {
        let (mut elector, _rx) = elector();
        let start = Instant::now();
        elector.observe(Ok(true), start);

        // a record that cannot be decoded will not decode on the next tick either
        assert_eq!(
            elector.observe(Err(LeasePoolError::Codec("bad json".into())), start),
            Some(LeadershipEvent::LostLeadership)
        );
        assert_eq!(
            elector.observe(Err(LeasePoolError::Codec("bad json".into())), start),
            None
        );
    }
}
