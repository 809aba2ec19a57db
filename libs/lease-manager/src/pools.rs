//! Pool cache, kept current from pool notifications, and the status table
//! rendered from it.
use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use resource_store::{Kind, Pool, ResourceStore, Selector};
use serde::Serialize;
use tracing::{debug, error};

use crate::{LeaseResult, metrics::POOL_RECONCILES, reconcile::Reconciler};

#[derive(Debug, Default)]
pub struct PoolCache {
    pools: Mutex<BTreeMap<String, Pool>>,
}

impl PoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, pool: &Pool) {
        if pool.meta.is_deleting() {
            self.remove(pool.name());
            return;
        }
        self.pools
            .lock()
            .insert(pool.name().to_owned(), pool.clone());
    }

    pub fn remove(&self, name: &str) -> Option<Pool> {
        self.pools.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Pool> {
        self.pools.lock().get(name).cloned()
    }

    pub fn replace(&self, pools: &[Pool]) {
        let mut cached = self.pools.lock();
        cached.clear();
        for pool in pools.iter().filter(|p| !p.meta.is_deleting()) {
            cached.insert(pool.name().to_owned(), pool.clone());
        }
    }

    pub fn report(&self) -> PoolReport {
        PoolReport(
            self.pools
                .lock()
                .values()
                .map(|pool| PoolRow {
                    name: pool.name().to_owned(),
                    vcpus_available: pool.status.vcpus_available,
                    memory_available: pool.status.memory_available,
                    schedulable: !pool.spec.no_schedule,
                })
                .collect(),
        )
    }
}

/// One line of [`PoolReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolRow {
    pub name: String,
    pub vcpus_available: u32,
    /// GB
    pub memory_available: u32,
    pub schedulable: bool,
}

/// Available capacity per pool, sorted by pool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PoolReport(pub Vec<PoolRow>);

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .0
            .iter()
            .map(|row| row.name.len())
            .max()
            .unwrap_or(0)
            .max("Pool".len());
        writeln!(
            f,
            "{:<width$}  {:>10}  {:>9}  {:>11}",
            "Pool", "Avail CPUs", "Avail Mem", "Schedulable"
        )?;
        for row in &self.0 {
            writeln!(
                f,
                "{:<width$}  {:>10}  {:>9}  {:>11}",
                row.name, row.vcpus_available, row.memory_available, row.schedulable
            )?;
        }
        Ok(())
    }
}

/// Mirrors pool objects into a [`PoolCache`].
#[derive(Debug)]
pub struct PoolReconciler<S> {
    store: Arc<S>,
    cache: Arc<PoolCache>,
    namespace: String,
}

impl<S: ResourceStore> PoolReconciler<S> {
    pub fn new(store: Arc<S>, cache: Arc<PoolCache>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            cache,
            namespace: namespace.into(),
        }
    }

    pub async fn reconcile(&self, name: &str) -> LeaseResult<()> {
        POOL_RECONCILES.inc();
        match self.store.get::<Pool>(&self.namespace, name).await {
            Ok(pool) => self.cache.upsert(&pool),
            Err(err) if err.is_not_found() => {
                self.cache.remove(name);
            }
            Err(err) => return Err(err.into()),
        }
        debug!(pool = %name, "pool reconciled");
        Ok(())
    }
}

#[async_trait]
impl<S: ResourceStore> Reconciler for PoolReconciler<S> {
    const KIND: Kind = Kind::Pool;

    fn schedule(self: &Arc<Self>, name: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.reconcile(&name).await {
                // the next notification for this pool tries again
                error!(pool = %name, ?err, "pool reconcile failed");
            }
        });
    }

    async fn resync(&self) -> LeaseResult<Vec<String>> {
        let pools = self
            .store
            .list::<Pool>(&self.namespace, &Selector::everything())
            .await?;
        self.cache.replace(&pools);
        Ok(Vec::new())
    }
}
