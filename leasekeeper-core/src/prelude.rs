//! leasekeeper prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    chrono::{self, DateTime, Utc},
    tokio,
    tokio_util::sync::CancellationToken,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{sync::Arc, time::Duration};
