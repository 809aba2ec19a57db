//! # leasekeeper
//!
//! shared plumbing for the leasekeeper service: cli & tracing config, env
//! var helpers, process level metrics and a prelude of common re-exports.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use futures;
pub use tokio;
pub use tokio_util;
pub use tracing;
pub use tracing_futures;

pub mod config;
pub mod env;
pub mod metrics;
pub mod prelude;
