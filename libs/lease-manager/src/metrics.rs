//! # Lease lifecycle metrics
//!
//! Counters for the lifecycle operations, the reconcilers, the pruning sweep
//! and the provisioning worker.
use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

use crate::LeaseResult;

make_static_metric! {
    pub struct LifecycleOps: IntCounter {
        "operation" => {
            acquire,
            renew,
            release,
            status,
        },
        "outcome" => {
            ok,
            rejected,
            failed,
        },
    }
}

lazy_static! {
    pub static ref LIFECYCLE_OPS_VEC: IntCounterVec = register_int_counter_vec!(
        "lifecycle_ops",
        "lifecycle operations by operation and outcome",
        &["operation", "outcome"]
    )
    .unwrap();
    /// lifecycle operations by outcome, `rejected` is a business rule error
    pub static ref LIFECYCLE_OPS: LifecycleOps = LifecycleOps::from(&LIFECYCLE_OPS_VEC);

    /// leases currently in the cache
    pub static ref CACHED_LEASES: IntGauge =
        register_int_gauge!("cached_leases", "leases held in the lease cache").unwrap();
    /// users holding a compute lease
    pub static ref ACTIVE_USERS: IntGauge =
        register_int_gauge!("active_users", "users holding a compute lease").unwrap();

    pub static ref LEASE_RECONCILES: IntCounter =
        register_int_counter!("lease_reconciles", "lease reconciliations run").unwrap();
    pub static ref LEASE_RECONCILE_ERRORS: IntCounter = register_int_counter!(
        "lease_reconcile_errors",
        "lease reconciliations that gave up after retries"
    )
    .unwrap();
    pub static ref LEASES_FINALIZED: IntCounter = register_int_counter!(
        "leases_finalized",
        "leases whose cleanup ran and finalizer was dropped"
    )
    .unwrap();
    pub static ref POOL_RECONCILES: IntCounter =
        register_int_counter!("pool_reconciles", "pool reconciliations run").unwrap();
    /// full relists after startup or a lagged subscription
    pub static ref RESYNCS: IntCounter =
        register_int_counter!("resyncs", "full relists of leases or pools").unwrap();

    pub static ref PRUNE_SWEEPS: IntCounter =
        register_int_counter!("prune_sweeps", "pruning sweeps run").unwrap();
    pub static ref LEASES_PRUNED: IntCounter =
        register_int_counter!("leases_pruned", "expired leases deleted").unwrap();
    pub static ref PRUNE_ERRORS: IntCounter =
        register_int_counter!("prune_errors", "expired leases that failed to delete").unwrap();
    pub static ref EXPIRY_WARNINGS: IntCounter =
        register_int_counter!("expiry_warnings", "renewal reminders sent").unwrap();

    pub static ref PROVISION_QUEUE_DEPTH: IntGauge =
        register_int_gauge!("provision_queue_depth", "leases waiting for provisioning").unwrap();
    pub static ref PROVISION_COMPLETED: IntCounter = register_int_counter!(
        "provision_completed",
        "leases whose details were delivered"
    )
    .unwrap();
    pub static ref PROVISION_REQUEUED: IntCounter =
        register_int_counter!("provision_requeued", "provisioning items requeued").unwrap();
    /// account creation failed, a human has to step in
    pub static ref PROVISION_ABANDONED: IntCounter =
        register_int_counter!("provision_abandoned", "provisioning items abandoned").unwrap();
    pub static ref DNS_FAILURES: IntCounter =
        register_int_counter!("dns_failures", "dns upserts or deletes that failed").unwrap();
    pub static ref ACCOUNT_FAILURES: IntCounter = register_int_counter!(
        "account_failures",
        "account creations or deletions that failed"
    )
    .unwrap();
    pub static ref MESSAGE_FAILURES: IntCounter =
        register_int_counter!("message_failures", "direct messages that failed").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Acquire,
    Renew,
    Release,
    Status,
}

/// count `res` against `op`
pub(crate) fn observe<T>(op: Op, res: &LeaseResult<T>) {
    let counters = match op {
        Op::Acquire => &LIFECYCLE_OPS.acquire,
        Op::Renew => &LIFECYCLE_OPS.renew,
        Op::Release => &LIFECYCLE_OPS.release,
        Op::Status => &LIFECYCLE_OPS.status,
    };
    match res {
        Ok(_) => counters.ok.inc(),
        Err(err) if err.is_business_rule() => counters.rejected.inc(),
        Err(_) => counters.failed.inc(),
    }
}
