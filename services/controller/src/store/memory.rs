//! In-memory store for one resource kind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;
use uuid::Uuid;

use super::{ResourceStore, StoreError, WatchEvent};
use crate::resources::{ObjectKey, Resource};

const WATCH_CAPACITY: usize = 1024;

/// Records of kind `K` keyed by namespace and name.
///
/// The version counter is shared between the stores of one cluster so
/// `resourceVersion` is monotonic across kinds.
pub struct MemoryStore<K: Resource> {
    objects: RwLock<BTreeMap<ObjectKey, K>>,
    versions: Arc<AtomicU64>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: Resource> MemoryStore<K> {
    pub fn new(versions: Arc<AtomicU64>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            versions,
            events,
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn normalize(key: &ObjectKey) -> ObjectKey {
        if K::NAMESPACED {
            key.clone()
        } else {
            ObjectKey::cluster_scoped(&key.name)
        }
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: K::KIND,
            key: key.clone(),
        }
    }

    fn check_version(current: &K, incoming: &K) -> Result<(), StoreError> {
        let expected = incoming.meta().resource_version;
        let actual = current.meta().resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                kind: K::KIND,
                key: current.key(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl<K: Resource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)))
    }
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let key = Self::normalize(key);
        self.objects
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, mut obj: K) -> Result<K, StoreError> {
        if obj.meta().name.is_empty() {
            return Err(StoreError::Invalid {
                kind: K::KIND,
                reason: "metadata.name is required".to_string(),
            });
        }
        if !K::NAMESPACED {
            obj.meta_mut().namespace.clear();
        } else if obj.meta().namespace.is_empty() {
            return Err(StoreError::Invalid {
                kind: K::KIND,
                reason: "metadata.namespace is required".to_string(),
            });
        }

        let key = obj.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND,
                key,
            });
        }

        let meta = obj.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = self.next_version();
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        trace!(kind = K::KIND, key = %key, "created");
        objects.insert(key, obj.clone());
        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: K) -> Result<K, StoreError> {
        let key = Self::normalize(&obj.key());
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, &obj)?;

        obj.set_status_from(current);
        let server = current.meta();
        let meta = obj.meta_mut();
        meta.namespace = key.namespace.clone();
        meta.uid = server.uid.clone();
        meta.creation_timestamp = server.creation_timestamp;
        meta.deletion_timestamp = server.deletion_timestamp;

        if obj.meta().is_deleting() && obj.meta().finalizers.is_empty() {
            let removed = objects.remove(&key).unwrap_or(obj.clone());
            trace!(kind = K::KIND, key = %key, "finalizers released, removed");
            self.publish(WatchEvent::Deleted(removed));
            return Ok(obj);
        }

        if &obj == current {
            return Ok(obj);
        }

        let old = current.clone();
        obj.meta_mut().resource_version = self.next_version();
        objects.insert(key, obj.clone());
        self.publish(WatchEvent::Modified {
            old,
            new: obj.clone(),
        });
        Ok(obj)
    }

    async fn update_status(&self, obj: K) -> Result<K, StoreError> {
        let key = Self::normalize(&obj.key());
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, &obj)?;

        let mut next = current.clone();
        next.set_status_from(&obj);
        if &next == current {
            return Ok(next);
        }

        let old = current.clone();
        next.meta_mut().resource_version = self.next_version();
        objects.insert(key, next.clone());
        self.publish(WatchEvent::Modified {
            old,
            new: next.clone(),
        });
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let key = Self::normalize(key);
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;

        if current.meta().finalizers.is_empty() {
            if let Some(removed) = objects.remove(&key) {
                trace!(kind = K::KIND, key = %key, "deleted");
                self.publish(WatchEvent::Deleted(removed));
            }
            return Ok(());
        }

        if current.meta().is_deleting() {
            return Ok(());
        }

        let old = current.clone();
        let mut next = current.clone();
        next.meta_mut().deletion_timestamp = Some(Utc::now());
        next.meta_mut().resource_version = self.next_version();
        trace!(kind = K::KIND, key = %key, "marked for deletion");
        objects.insert(key, next.clone());
        self.publish(WatchEvent::Modified { old, new: next });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}
