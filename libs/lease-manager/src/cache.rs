//! # Lease cache
//!
//! Derived view of the lease resources, rebuilt from reconciliation. One
//! mutex guards every map and is never held across an await.
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resource_store::Lease;
use tracing::debug;

use crate::{
    LeaseError, LeaseResult,
    context::Settings,
    keys::LeaseExt,
    metrics::{ACTIVE_USERS, CACHED_LEASES},
};

#[derive(Debug, Default)]
pub struct LeaseCache {
    inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    leases: HashMap<String, Lease>,
    active: HashMap<String, Lease>,
    /// users with an Acquire in flight
    acquiring: HashSet<String>,
    /// leases handed to the provisioning worker and not yet finished
    queued: HashSet<String>,
    /// lease name -> expiration a reminder was sent for
    warned: HashMap<String, DateTime<Utc>>,
    /// leases whose deletion was requested, never made active again
    released: HashSet<String>,
}

impl State {
    fn update_gauges(&self) {
        CACHED_LEASES.set(self.leases.len() as i64);
        ACTIVE_USERS.set(self.active.len() as i64);
    }

    fn forget(&mut self, name: &str) -> Option<Lease> {
        let removed = self.leases.remove(name);
        self.active.retain(|_, lease| lease.name() != name);
        self.warned.remove(name);
        self.released.remove(name);
        removed
    }

    fn activate(&mut self, lease: &Lease) {
        if lease.is_network_only() || self.released.contains(lease.name()) {
            return;
        }
        if let Some(owner) = lease.owner() {
            self.active.insert(owner.to_owned(), lease.clone());
        }
    }
}

/// What a sweep should do, decided under the lock.
#[derive(Debug, Default)]
pub struct PrunePlan {
    /// leases inside the warning window, with the expiration being warned about
    pub warn: Vec<(Lease, DateTime<Utc>)>,
    pub expired: Vec<Lease>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live lease. Owned compute leases also become the owner's
    /// active lease.
    pub fn upsert(&self, lease: &Lease) {
        if lease.meta.is_deleting() {
            self.remove(lease.name());
            return;
        }
        let mut state = self.inner.lock();
        state
            .leases
            .insert(lease.name().to_owned(), lease.clone());
        state.activate(lease);
        state.update_gauges();
    }

    /// Drop a lease from both maps.
    pub fn remove(&self, name: &str) -> Option<Lease> {
        let mut state = self.inner.lock();
        let removed = state.forget(name);
        state.update_gauges();
        removed
    }

    pub fn get(&self, name: &str) -> Option<Lease> {
        self.inner.lock().leases.get(name).cloned()
    }

    pub fn active_lease(&self, user: &str) -> Option<Lease> {
        self.inner.lock().active.get(user).cloned()
    }

    pub fn has_active_lease(&self, user: &str) -> bool {
        self.inner.lock().active.contains_key(user)
    }

    /// Forget `user`'s active lease after deletion of `released` was
    /// requested. A reconcile that read one of them before the delete won't
    /// make it active again.
    pub fn clear_user(&self, user: &str, released: &[Lease]) -> Option<Lease> {
        let mut state = self.inner.lock();
        let removed = state.active.remove(user);
        state
            .released
            .extend(released.iter().map(|lease| lease.name().to_owned()));
        state.update_gauges();
        removed
    }

    /// all cached leases, sorted by name
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases = self
            .inner
            .lock()
            .leases
            .values()
            .cloned()
            .collect::<Vec<_>>();
        leases.sort_by(|a, b| a.name().cmp(b.name()));
        leases
    }

    pub fn len(&self) -> usize {
        self.inner.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the cache contents with a full listing. Queue and warning
    /// bookkeeping for leases that still exist is kept.
    pub fn replace(&self, leases: &[Lease]) {
        let mut state = self.inner.lock();
        state.leases.clear();
        state.active.clear();
        for lease in leases.iter().filter(|l| !l.meta.is_deleting()) {
            state.leases.insert(lease.name().to_owned(), lease.clone());
            state.activate(lease);
        }
        let State {
            leases: live,
            warned,
            queued,
            released,
            ..
        } = &mut *state;
        warned.retain(|name, _| live.contains_key(name));
        queued.retain(|name| live.contains_key(name));
        released.retain(|name| leases.iter().any(|lease| lease.name() == name));
        state.update_gauges();
    }

    /// Reserve `user` for an Acquire. Fails if the user already has a lease
    /// or another Acquire for them is in flight. The reservation is dropped
    /// with the guard.
    pub fn begin_acquire(&self, user: &str) -> LeaseResult<AcquireGuard<'_>> {
        let mut state = self.inner.lock();
        if state.active.contains_key(user) || !state.acquiring.insert(user.to_owned()) {
            return Err(LeaseError::AlreadyLeased);
        }
        Ok(AcquireGuard {
            cache: self,
            user: user.to_owned(),
        })
    }

    /// Mark a lease as queued for provisioning. Returns false if it already was.
    pub fn mark_queued(&self, name: &str) -> bool {
        self.inner.lock().queued.insert(name.to_owned())
    }

    pub fn unmark_queued(&self, name: &str) {
        self.inner.lock().queued.remove(name);
    }

    pub fn is_queued(&self, name: &str) -> bool {
        self.inner.lock().queued.contains(name)
    }

    /// Walk the cache and decide which leases expired and which owners need
    /// a reminder. A reminder is recorded as sent for the expiration it
    /// announces, so renewing arms it again.
    pub fn prune_plan(&self, now: DateTime<Utc>, settings: &Settings) -> PrunePlan {
        let mut plan = PrunePlan::default();
        let mut state = self.inner.lock();
        let State {
            leases, warned, ..
        } = &mut *state;
        for lease in leases.values() {
            if lease.owner().is_none() || lease.meta.is_deleting() || lease.pruning_disabled() {
                continue;
            }
            let Some(expires_at) = settings.expires_at(lease) else {
                continue;
            };
            if now >= expires_at {
                plan.expired.push(lease.clone());
            } else if now >= settings.warn_at(expires_at)
                && warned.get(lease.name()) != Some(&expires_at)
            {
                warned.insert(lease.name().to_owned(), expires_at);
                plan.warn.push((lease.clone(), expires_at));
            }
        }
        debug!(
            warn = plan.warn.len(),
            expired = plan.expired.len(),
            "computed prune plan"
        );
        plan
    }

    /// Forget a reminder so the next sweep tries again.
    pub fn clear_warning(&self, name: &str) {
        self.inner.lock().warned.remove(name);
    }
}

/// Holds a user's Acquire reservation.
#[derive(Debug)]
pub struct AcquireGuard<'a> {
    cache: &'a LeaseCache,
    user: String,
}

impl AcquireGuard<'_> {
    /// Record the new lease as the user's active lease and release the
    /// reservation.
    pub fn commit(self, lease: &Lease) {
        let mut state = self.cache.inner.lock();
        state.leases.insert(lease.name().to_owned(), lease.clone());
        state.active.insert(self.user.clone(), lease.clone());
        state.update_gauges();
    }
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().acquiring.remove(&self.user);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use config::LeaseKeeperConfig;
    use resource_store::{LeaseSpec, ObjectMeta};

    use super::*;
    use crate::keys;

    fn lease(name: &str, owner: Option<&str>, created: DateTime<Utc>) -> Lease {
        let mut meta = ObjectMeta::new("ns", name);
        meta.creation_timestamp = Some(created);
        if let Some(owner) = owner {
            meta.labels.insert(keys::OWNER.into(), owner.into());
            meta.annotations.insert(keys::OWNER.into(), owner.into());
        }
        Lease::new(meta, LeaseSpec::default())
    }

    fn settings() -> Settings {
        Settings::new(&LeaseKeeperConfig::default()).unwrap()
    }

    #[test]
    fn test_upsert_and_remove() {
        let cache = LeaseCache::new();
        let now = Utc::now();
        cache.upsert(&lease("a", Some("alice"), now));
        cache.upsert(&lease("b", None, now));
        let mut net = lease("c", Some("alice"), now);
        net.meta.labels.insert(keys::NETWORK_ONLY.into(), "true".into());
        cache.upsert(&net);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.active_lease("alice").unwrap().name(), "a");

        // a deleting lease clears both maps
        let mut deleting = lease("a", Some("alice"), now);
        deleting.meta.deletion_timestamp = Some(now);
        cache.upsert(&deleting);
        assert!(!cache.has_active_lease("alice"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_released_lease_stays_inactive() {
        let cache = LeaseCache::new();
        let now = Utc::now();
        let stale = lease("a", Some("alice"), now);
        cache.upsert(&stale);

        assert_eq!(cache.clear_user("alice", &[stale.clone()]).unwrap().name(), "a");
        // a pass that read the lease before it was deleted
        cache.upsert(&stale);
        assert!(!cache.has_active_lease("alice"));
        drop(cache.begin_acquire("alice").unwrap());

        // a new lease for the same user is active as usual
        cache.upsert(&lease("b", Some("alice"), now));
        assert_eq!(cache.active_lease("alice").unwrap().name(), "b");

        // finalized, the name is forgotten
        cache.remove("a");
        cache.upsert(&stale);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_acquire_reservation() {
        let cache = LeaseCache::new();
        let guard = cache.begin_acquire("alice").unwrap();
        assert!(matches!(
            cache.begin_acquire("alice"),
            Err(LeaseError::AlreadyLeased)
        ));
        // another user is not blocked
        drop(cache.begin_acquire("bob").unwrap());
        drop(guard);

        let guard = cache.begin_acquire("alice").unwrap();
        guard.commit(&lease("a", Some("alice"), Utc::now()));
        assert!(matches!(
            cache.begin_acquire("alice"),
            Err(LeaseError::AlreadyLeased)
        ));
        assert_eq!(cache.active_lease("alice").unwrap().name(), "a");
    }

    #[test]
    fn test_queue_marks() {
        let cache = LeaseCache::new();
        assert!(cache.mark_queued("a"));
        assert!(!cache.mark_queued("a"));
        assert!(cache.is_queued("a"));
        cache.unmark_queued("a");
        assert!(cache.mark_queued("a"));
    }

    #[test]
    fn test_prune_plan() {
        let cache = LeaseCache::new();
        let settings = settings();
        let created = Utc::now() - TimeDelta::hours(10);
        let now = Utc::now();

        // expired 2h ago
        cache.upsert(&lease("expired", Some("alice"), created));
        // renewed once, expires in 6h
        let mut renewed = lease("renewed", Some("bob"), created);
        renewed.meta.labels.insert(keys::RENEW_COUNT.into(), "1".into());
        cache.upsert(&renewed);
        // expires in 30m
        cache.upsert(&lease(
            "warn",
            Some("carol"),
            now - TimeDelta::hours(7) - TimeDelta::minutes(30),
        ));
        let mut pinned = lease("pinned", Some("dave"), created);
        pinned
            .meta
            .annotations
            .insert(keys::DISABLE_PRUNING.into(), "true".into());
        cache.upsert(&pinned);
        cache.upsert(&lease("unowned", None, created));

        let plan = cache.prune_plan(now, &settings);
        let expired = plan.expired.iter().map(|l| l.name()).collect::<Vec<_>>();
        assert_eq!(expired, vec!["expired"]);
        assert_eq!(plan.warn.len(), 1);
        assert_eq!(plan.warn[0].0.name(), "warn");

        // the reminder is only sent once per expiration
        let plan = cache.prune_plan(now, &settings);
        assert!(plan.warn.is_empty());
        cache.clear_warning("warn");
        assert_eq!(cache.prune_plan(now, &settings).warn.len(), 1);
    }

    #[test]
    fn test_replace() {
        let cache = LeaseCache::new();
        let now = Utc::now();
        cache.upsert(&lease("old", Some("alice"), now));
        cache.mark_queued("old");
        cache.replace(&[lease("new", Some("bob"), now)]);
        assert!(cache.get("old").is_none());
        assert!(!cache.has_active_lease("alice"));
        assert!(cache.has_active_lease("bob"));
        assert!(!cache.is_queued("old"));
    }
}
