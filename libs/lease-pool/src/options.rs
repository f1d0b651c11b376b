//! Per-lease timing and ownership options.

use std::time::Duration;

use crate::error::{LeasePoolError, LeasePoolResult};

/// Default lease namespace (bucket / partition in the backend).
pub const DEFAULT_NAMESPACE: &str = "node-lease";
/// Default time a lease stays valid without renewal.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
/// Default time a leader keeps retrying renewal before giving up leadership.
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(15);
/// Default interval between acquire/renew attempts.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Options passed along with a lease registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOptions {
    /// Identity written into the lease record as its holder.
    pub holder_identity: String,
    /// Backend partition the lease key lives in.
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseOptions {
    /// Options with default timings for the given holder.
    pub fn new(holder_identity: impl Into<String>) -> Self {
        Self {
            holder_identity: holder_identity.into(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    pub fn with_holder_identity(mut self, holder_identity: impl Into<String>) -> Self {
        self.holder_identity = holder_identity.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_renew_deadline(mut self, renew_deadline: Duration) -> Self {
        self.renew_deadline = renew_deadline;
        self
    }

    pub fn with_retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    /// Check holder and timing constraints:
    /// `0 < retry_period < renew_deadline < lease_duration`.
    pub fn validate(&self) -> LeasePoolResult<()> {
        if self.holder_identity.trim().is_empty() {
            return Err(LeasePoolError::Config(
                "lease holder identity must not be empty".into(),
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(LeasePoolError::Config(
                "lease namespace must not be empty".into(),
            ));
        }
        if self.retry_period.is_zero() {
            return Err(LeasePoolError::Config(
                "retry period must be greater than zero".into(),
            ));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(LeasePoolError::Config(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(LeasePoolError::Config(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let opts = LeaseOptions::new("node-a");
        assert_eq!(opts.namespace, DEFAULT_NAMESPACE);
        assert_eq!(opts.lease_duration, Duration::from_secs(60));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timings() {
        let opts = LeaseOptions::new("node-a").with_retry_period(Duration::from_secs(15));
        assert!(matches!(opts.validate(), Err(LeasePoolError::Config(_))));

        let opts = LeaseOptions::new("node-a").with_renew_deadline(Duration::from_secs(60));
        assert!(matches!(opts.validate(), Err(LeasePoolError::Config(_))));

        let opts = LeaseOptions::new("node-a").with_retry_period(Duration::ZERO);
        assert!(matches!(opts.validate(), Err(LeasePoolError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_blank_holder() {
        let opts = LeaseOptions::new("  ");
        assert!(opts.validate().is_err());
        assert!(opts.with_holder_identity("node-a").validate().is_ok());
    }
}
