//! # metrics
//!
//! process level statistics, subsystem metrics live next to the subsystem
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    /// # of background tasks currently running
    pub static ref BACKGROUND_TASKS: IntGauge =
        register_int_gauge!("background_tasks", "count of running background tasks").unwrap();

    /// background tasks that exited before shutdown was requested
    pub static ref BACKGROUND_TASK_EXITS: IntCounter =
        register_int_counter!("background_task_exits", "count of background tasks that exited unexpectedly").unwrap();
}
