//! Background consumer of one lease's leadership events.

use lease_pool::{LeaseEvents, Unsubscribe, WatchStep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{LEASE_ACQUIRED, LEASE_HELD, LEASE_LOST};

/// What a finished watch loop saw
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchReport {
    pub acquired: usize,
    pub lost: usize,
    /// the backend closed the stream, as opposed to us cancelling
    pub closed: bool,
}

/// Log and count each transition until `token` is cancelled or the backend
/// closes the stream. Pending events are not drained after cancellation.
///
/// The subscription is released once on exit, so the backend stops renewing
/// as soon as the scope owning `token` goes away.
pub(crate) async fn watch_loop(
    key: String,
    mut events: LeaseEvents,
    unsubscribe: Unsubscribe,
    token: CancellationToken,
) -> WatchReport {
    let mut report = WatchReport::default();
    loop {
        match events.next(&token).await {
            WatchStep::Acquired => {
                info!(%key, "acquired leader lease");
                report.acquired += 1;
                LEASE_ACQUIRED.inc();
                LEASE_HELD.set(1);
            }
            WatchStep::Lost => {
                error!(%key, "lost leader lease");
                report.lost += 1;
                LEASE_LOST.inc();
                LEASE_HELD.set(0);
            }
            WatchStep::Cancelled => {
                debug!(%key, "lease watch cancelled");
                break;
            }
            WatchStep::Closed => {
                warn!(%key, "lease event stream closed by backend");
                report.closed = true;
                break;
            }
        }
    }
    unsubscribe.unsubscribe();
    LEASE_HELD.set(0);
    report
}
