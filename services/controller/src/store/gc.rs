//! Owner-reference garbage collection.
//!
//! Dependents whose controlling owner is gone are deleted. Deletion goes
//! through the normal store path so finalizers on dependents still apply.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, info, instrument, warn};

use super::{ResourceStore, StoreError, WatchEvent};
use crate::resources::{ObjectKey, Resource};

/// Deletes `D` records whose controlling `O` owner no longer exists.
pub struct GarbageCollector<O: Resource, D: Resource> {
    owners: Arc<dyn ResourceStore<O>>,
    dependents: Arc<dyn ResourceStore<D>>,
    sweep_interval: Duration,
}

impl<O: Resource, D: Resource> GarbageCollector<O, D> {
    pub fn new(
        owners: Arc<dyn ResourceStore<O>>,
        dependents: Arc<dyn ResourceStore<D>>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            owners,
            dependents,
            sweep_interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip_all, fields(owner = O::KIND, dependent = D::KIND))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Starting garbage collector"
        );

        let mut events = self.owners.watch();
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Orphan sweep failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(WatchEvent::Deleted(owner)) => {
                        if let Err(e) = self.collect_owned_by(&owner).await {
                            warn!(error = %e, owner = %owner.key(), "Cascade delete failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Owner watch lagged, sweeping");
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Orphan sweep failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Garbage collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Delete the dependents of a deleted owner. Returns how many were deleted.
    pub async fn collect_owned_by(&self, owner: &O) -> Result<usize, StoreError> {
        let uid = &owner.meta().uid;
        let namespace = owner.meta().namespace.as_str();
        let scope = (!namespace.is_empty()).then_some(namespace);

        let mut deleted = 0;
        for dependent in self.dependents.list(scope).await? {
            if dependent.meta().is_owned_by(uid) && self.delete(&dependent.key()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete every dependent whose controlling owner cannot be found.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for dependent in self.dependents.list(None).await? {
            if dependent.meta().is_deleting() {
                continue;
            }
            let Some(owner_ref) = dependent.meta().controller_owner() else {
                continue;
            };
            if owner_ref.kind != O::KIND {
                continue;
            }

            let owner_key = ObjectKey::new(&dependent.meta().namespace, &owner_ref.name);
            let alive = self
                .owners
                .get_opt(&owner_key)
                .await?
                .is_some_and(|owner| owner.meta().uid == owner_ref.uid);
            if !alive && self.delete(&dependent.key()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        match self.dependents.delete(key).await {
            Ok(()) => {
                info!(
                    kind = D::KIND,
                    namespace = %key.namespace,
                    name = %key.name,
                    "Deleted orphaned dependent"
                );
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
