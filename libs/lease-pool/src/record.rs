//! Stored lease records and the acquire/renew rule shared by every backend.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LeasePoolError, LeasePoolResult};

/// The value stored under a lease key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Identity of the node currently holding the lease.
    pub holder_identity: String,
    /// How long the lease stays valid after `renew_time`, in milliseconds.
    pub lease_duration_ms: u64,
    /// When the current holder first took the lease.
    pub acquire_time: DateTime<Utc>,
    /// Last successful renewal by the current holder.
    pub renew_time: DateTime<Utc>,
    /// Number of times the lease changed hands.
    pub lease_transitions: u32,
}

impl LeaseRecord {
    /// A fresh record held by `holder`.
    pub fn new(holder: impl Into<String>, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: holder.into(),
            lease_duration_ms: duration_ms(duration),
            acquire_time: now,
            renew_time: now,
            lease_transitions: 0,
        }
    }

    /// Instant after which the record no longer protects its holder.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ms = i64::try_from(self.lease_duration_ms).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(ms)
            .and_then(|d| self.renew_time.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    /// The holder may always renew; anyone else only once the record expired.
    pub fn can_be_taken_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder_identity == holder || self.is_expired(now)
    }

    /// Same holder, renewal time moved to `now`.
    pub fn renewed(&self, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            lease_duration_ms: duration_ms(duration),
            renew_time: now,
            ..self.clone()
        }
    }

    /// New holder taking over an expired record.
    pub fn taken_over_by(&self, holder: &str, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: holder.to_owned(),
            lease_duration_ms: duration_ms(duration),
            acquire_time: now,
            renew_time: now,
            lease_transitions: self.lease_transitions.saturating_add(1),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Compute the record `holder` should write given what is currently stored.
///
/// Returns `None` when another holder's unexpired record blocks the claim.
pub fn claim(
    existing: Option<&LeaseRecord>,
    holder: &str,
    duration: Duration,
    now: DateTime<Utc>,
) -> Option<LeaseRecord> {
    match existing {
        None => Some(LeaseRecord::new(holder, duration, now)),
        Some(current) if current.holder_identity == holder => {
            Some(current.renewed(duration, now))
        }
        Some(current) if current.is_expired(now) => {
            Some(current.taken_over_by(holder, duration, now))
        }
        Some(_) => None,
    }
}

/// Encode a record to JSON bytes for storage.
pub fn encode(record: &LeaseRecord) -> LeasePoolResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| LeasePoolError::Codec(e.to_string()))
}

/// Decode JSON bytes from storage into a record.
pub fn decode(data: &[u8]) -> LeasePoolResult<LeaseRecord> {
    serde_json::from_slice(data).map_err(|e| LeasePoolError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_claim_empty_key() {
        let record = claim(None, "node-a", MINUTE, at(0)).unwrap();
        assert_eq!(record.holder_identity, "node-a");
        assert_eq!(record.lease_transitions, 0);
        assert_eq!(record.expires_at(), at(60));
    }

    #[test]
    fn test_claim_renew_keeps_acquire_time() {
        let first = claim(None, "node-a", MINUTE, at(0)).unwrap();
        let renewed = claim(Some(&first), "node-a", MINUTE, at(30)).unwrap();
        assert_eq!(renewed.acquire_time, at(0));
        assert_eq!(renewed.renew_time, at(30));
        assert_eq!(renewed.lease_transitions, 0);
    }

    #[test]
    fn test_claim_blocked_by_live_holder() {
        let held = claim(None, "node-a", MINUTE, at(0)).unwrap();
        assert!(claim(Some(&held), "node-b", MINUTE, at(59)).is_none());
        assert!(!held.can_be_taken_by("node-b", at(59)));
        assert!(held.can_be_taken_by("node-a", at(59)));
    }

    #[test]
    fn test_claim_takes_over_expired() {
        let held = claim(None, "node-a", MINUTE, at(0)).unwrap();
        assert!(held.is_expired(at(60)));
        let taken = claim(Some(&held), "node-b", MINUTE, at(61)).unwrap();
        assert_eq!(taken.holder_identity, "node-b");
        assert_eq!(taken.acquire_time, at(61));
        assert_eq!(taken.lease_transitions, 1);
    }

    #[test]
    fn test_sub_second_duration_kept() {
        let duration = Duration::from_millis(900);
        let held = claim(None, "node-a", duration, at(0)).unwrap();
        assert_eq!(held.lease_duration_ms, 900);
        assert!(!held.is_expired(at(0)));
        assert!(claim(Some(&held), "node-b", duration, at(0)).is_none());
        assert!(held.is_expired(at(1)));
    }

    #[test]
    fn test_huge_duration_never_expires() {
        let record = LeaseRecord::new("node-a", Duration::from_secs(u64::MAX), at(0));
        assert!(!record.is_expired(at(1_000_000)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"not json").unwrap_err();
        assert!(matches!(err, LeasePoolError::Codec(_)));

        let record = LeaseRecord::new("node-a", MINUTE, at(0));
        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }
}
