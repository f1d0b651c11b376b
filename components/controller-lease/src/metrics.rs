//! controller presence lease metrics
//!
//! Registered with the default prometheus registry on first access, so they
//! show up on the external api's `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of times this node acquired its controller lease
    pub static ref LEASE_ACQUIRED: IntCounter = register_int_counter!(
        "controller_lease_acquired",
        "count of controller lease acquisitions on this node"
    ).unwrap();

    /// Count of times this node lost its controller lease
    pub static ref LEASE_LOST: IntCounter = register_int_counter!(
        "controller_lease_lost",
        "count of controller lease losses on this node"
    ).unwrap();

    /// 1 while this node holds its controller lease
    pub static ref LEASE_HELD: IntGauge = register_int_gauge!(
        "controller_lease_held",
        "1 while this node holds its controller lease, else 0"
    ).unwrap();

    /// Count of starts that ran without a lease because identity could not be resolved
    pub static ref START_DEGRADED: IntCounter = register_int_counter!(
        "controller_lease_start_degraded",
        "count of component starts that registered no lease"
    ).unwrap();
}
