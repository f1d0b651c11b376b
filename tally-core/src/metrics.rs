#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! process-wide statistics exported on the external API
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntGauge, register_int_gauge};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// Seconds since the process started
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("uptime", "uptime in seconds").unwrap();

    /// Count of managed components currently running
    pub static ref RUNNING_COMPONENTS: IntGauge =
        register_int_gauge!("running_components", "count of managed components currently running").unwrap();
}
