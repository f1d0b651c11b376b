use lease_pool::LeasePoolError;
use thiserror::Error;

/// Failures that abort [`ControllersLeaseCounter::start`](crate::ControllersLeaseCounter::start).
///
/// Identity failures are not among them; they degrade the start instead, see
/// [`StartOutcome::Degraded`](crate::StartOutcome::Degraded).
#[derive(Debug, Error)]
pub enum ControllerLeaseError {
    #[error("lease client unavailable: {0}")]
    ClientUnavailable(#[source] LeasePoolError),
    #[error("failed to register lease '{key}': {source}")]
    LeaseRegistrationFailed {
        key: String,
        #[source]
        source: LeasePoolError,
    },
    #[error("failed to watch lease '{key}': {source}")]
    WatchSubscriptionFailed {
        key: String,
        #[source]
        source: LeasePoolError,
    },
    #[error("failed to list controller leases: {0}")]
    Query(#[source] LeasePoolError),
}
