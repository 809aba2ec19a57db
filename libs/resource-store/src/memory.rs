use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

use crate::{
    ChangeType, Kind, Notification, NotificationStream, Object, ObjectKey, Resource,
    ResourceStore, Selector, StoreError, StoreResult,
};

/// default number of notifications buffered per subscriber
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

const GENERATED_SUFFIX_LEN: usize = 5;
const GENERATED_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<Notification>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Object>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// `capacity` notifications are buffered per subscriber before it lags
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// number of objects currently stored, including ones being deleted
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // called with the lock held so notifications go out in write order
    fn notify(&self, change: ChangeType, object: Object) {
        trace!(key = %object.key(), ?change, "store change");
        // no subscribers is fine
        let _ = self.events.send(Notification { change, object });
    }
}

fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix = (0..GENERATED_SUFFIX_LEN)
        .map(|_| *GENERATED_ALPHABET.choose(&mut rng).unwrap_or(&b'x') as char)
        .collect::<String>();
    format!("{prefix}{suffix}")
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<R> {
        let key = ObjectKey::new(R::KIND, namespace, name);
        let guard = self.inner.lock();
        guard
            .objects
            .get(&key)
            .cloned()
            .and_then(R::from_object)
            .ok_or(StoreError::NotFound(key))
    }

    async fn list<R: Resource>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<R>> {
        let guard = self.inner.lock();
        Ok(guard
            .objects
            .iter()
            .filter(|(key, obj)| {
                key.kind == R::KIND
                    && key.namespace == namespace
                    && selector.matches(&obj.meta().labels)
            })
            .filter_map(|(_, obj)| R::from_object(obj.clone()))
            .collect())
    }

    async fn create<R: Resource>(&self, object: R) -> StoreResult<R> {
        let mut object = object.into_object();
        if object.meta().namespace.is_empty() {
            return Err(StoreError::Invalid("namespace is required".into()));
        }
        let mut guard = self.inner.lock();
        if object.meta().name.is_empty() {
            let prefix = object
                .meta()
                .generate_name
                .clone()
                .ok_or_else(|| StoreError::Invalid("name or generate_name is required".into()))?;
            let kind = object.kind();
            let namespace = object.meta().namespace.clone();
            let name = loop {
                let candidate = generate_name(&prefix);
                if !guard
                    .objects
                    .contains_key(&ObjectKey::new(kind, namespace.clone(), candidate.clone()))
                {
                    break candidate;
                }
            };
            object.meta_mut().name = name;
        }
        let key = object.key();
        if guard.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let version = guard.next_version();
        let meta = object.meta_mut();
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        meta.resource_version = version;

        debug!(%key, "created object");
        guard.objects.insert(key, object.clone());
        self.notify(ChangeType::Created, object.clone());
        R::from_object(object).ok_or_else(|| StoreError::Invalid("kind mismatch".into()))
    }

    async fn update<R: Resource>(&self, object: R) -> StoreResult<R> {
        let mut object = object.into_object();
        let key = object.key();
        let mut guard = self.inner.lock();
        let (deleting, current_version, creation, deletion, generate_name) =
            match guard.objects.get(&key) {
                Some(existing) => {
                    let meta = existing.meta();
                    (
                        meta.is_deleting(),
                        meta.resource_version,
                        meta.creation_timestamp,
                        meta.deletion_timestamp,
                        meta.generate_name.clone(),
                    )
                }
                None => return Err(StoreError::NotFound(key)),
            };
        if object.meta().resource_version != current_version {
            return Err(StoreError::Conflict {
                key,
                expected: object.meta().resource_version,
                actual: current_version,
            });
        }
        let version = guard.next_version();
        let meta = object.meta_mut();
        // timestamps are owned by the store
        meta.creation_timestamp = creation;
        meta.deletion_timestamp = deletion;
        meta.generate_name = generate_name;
        meta.resource_version = version;
        if deleting && !meta.finalizer {
            debug!(%key, "finalizer cleared, removing object");
            guard.objects.remove(&key);
            self.notify(ChangeType::Deleted, object.clone());
        } else {
            guard.objects.insert(key, object.clone());
            self.notify(ChangeType::Updated, object.clone());
        }
        R::from_object(object).ok_or_else(|| StoreError::Invalid("kind mismatch".into()))
    }

    async fn delete<R: Resource>(&self, object: &R) -> StoreResult<()> {
        let key = object.key();
        let mut guard = self.inner.lock();
        let (finalizer, deleting) = match guard.objects.get(&key) {
            Some(existing) => (existing.meta().finalizer, existing.meta().is_deleting()),
            None => return Err(StoreError::NotFound(key)),
        };
        if !finalizer {
            debug!(%key, "deleted object");
            if let Some(removed) = guard.objects.remove(&key) {
                self.notify(ChangeType::Deleted, removed);
            }
            return Ok(());
        }
        if deleting {
            // already waiting on its finalizer
            return Ok(());
        }
        let version = guard.next_version();
        if let Some(existing) = guard.objects.get_mut(&key) {
            let meta = existing.meta_mut();
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version = version;
            debug!(%key, "marked object for deletion");
            let snapshot = existing.clone();
            self.notify(ChangeType::Updated, snapshot);
        }
        Ok(())
    }

    fn subscribe(&self, kind: Kind) -> NotificationStream {
        let rx = self.events.subscribe();
        futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) if notification.kind() == kind => {
                        return Some((Ok(notification), rx));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => return Some((Err(StoreError::Lagged(n)), rx)),
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
