//! Versioned resource store.
//!
//! The controllers only see [`ResourceStore`]; the process wires in the
//! in-memory implementation. Every write is guarded by `resourceVersion`
//! and every accepted change is published on the kind's watch channel.

pub mod gc;
mod memory;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::resources::{ClusterConfig, FullConfig, Node, NodeConfig, ObjectKey, Pod, Resource};

pub use memory::MemoryStore;

/// Store operation errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The write carried a stale `resourceVersion`.
    #[error("{kind} {key} was modified: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },

    /// Transient backend failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// A change notification for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified { old: K, new: K },
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The most recent state carried by the event.
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Modified { new, .. } => new,
        }
    }
}

/// Storage for one resource kind.
#[async_trait]
pub trait ResourceStore<K: Resource>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Like [`get`](Self::get) but maps `NotFound` to `None`.
    async fn get_opt(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List records, optionally restricted to one namespace. Sorted by key.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    /// Create a record. The store assigns uid, version and creation time.
    async fn create(&self, obj: K) -> Result<K, StoreError>;

    /// Replace everything except status.
    ///
    /// Clearing the last finalizer of a record that is being deleted removes it.
    async fn update(&self, obj: K) -> Result<K, StoreError>;

    /// Replace only the status.
    async fn update_status(&self, obj: K) -> Result<K, StoreError>;

    /// Delete a record, or mark it for deletion while finalizers remain.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>>;
}

/// Handles to every store the controllers read or write.
#[derive(Clone)]
pub struct Cluster {
    pub cluster_configs: Arc<dyn ResourceStore<ClusterConfig>>,
    pub node_configs: Arc<dyn ResourceStore<NodeConfig>>,
    pub full_configs: Arc<dyn ResourceStore<FullConfig>>,
    pub nodes: Arc<dyn ResourceStore<Node>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
}

impl Cluster {
    /// In-memory stores sharing one version counter.
    pub fn in_memory() -> Self {
        let versions = Arc::new(AtomicU64::new(0));
        Self {
            cluster_configs: Arc::new(MemoryStore::new(versions.clone())),
            node_configs: Arc::new(MemoryStore::new(versions.clone())),
            full_configs: Arc::new(MemoryStore::new(versions.clone())),
            nodes: Arc::new(MemoryStore::new(versions.clone())),
            pods: Arc::new(MemoryStore::new(versions)),
        }
    }
}

/// Kinds with a store in [`Cluster`].
pub trait Stored: Resource {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>>;
}

impl Stored for ClusterConfig {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>> {
        &cluster.cluster_configs
    }
}

impl Stored for NodeConfig {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>> {
        &cluster.node_configs
    }
}

impl Stored for FullConfig {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>> {
        &cluster.full_configs
    }
}

impl Stored for Node {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>> {
        &cluster.nodes
    }
}

impl Stored for Pod {
    fn store(cluster: &Cluster) -> &Arc<dyn ResourceStore<Self>> {
        &cluster.pods
    }
}

/// Create `desired`, or replace the stored record keeping server-owned metadata.
///
/// Status is written through [`ResourceStore::update_status`] when it changed.
pub async fn apply<K: Resource>(
    store: &dyn ResourceStore<K>,
    mut desired: K,
) -> Result<K, StoreError> {
    let Some(current) = store.get_opt(&desired.key()).await? else {
        return store.create(desired).await;
    };

    let server = current.meta();
    let meta = desired.meta_mut();
    meta.uid = server.uid.clone();
    meta.resource_version = server.resource_version;
    meta.creation_timestamp = server.creation_timestamp;
    meta.deletion_timestamp = server.deletion_timestamp;
    if meta.finalizers.is_empty() {
        meta.finalizers = server.finalizers.clone();
    }
    if meta.owner_references.is_empty() {
        meta.owner_references = server.owner_references.clone();
    }

    let updated = store.update(desired.clone()).await?;
    let mut with_status = updated.clone();
    with_status.set_status_from(&desired);
    if with_status == updated {
        return Ok(updated);
    }
    store.update_status(with_status).await
}
