//! Pushes the cluster baseline into every FullConfig.

use std::sync::Arc;

use async_trait::async_trait;
use ipruler_reconcile::Action;
use tracing::{debug, info, instrument};

use super::Context;
use crate::error::ReconcileError;
use crate::resources::{ObjectKey, Resource};
use crate::runtime::Reconciler;

pub struct ClusterConfigReconciler {
    ctx: Arc<Context>,
}

impl ClusterConfigReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for ClusterConfigReconciler {
    fn name(&self) -> &'static str {
        "cluster-config"
    }

    /// One pass rebases at most one FullConfig and requeues; once none are
    /// stale, the `hasClusterConfig` flags are set.
    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let ctx = &self.ctx;
        let Some(baseline) = ctx.cluster.cluster_configs.get_opt(key).await? else {
            info!("ClusterConfig not found");
            return Ok(Action::Done);
        };

        if baseline.metadata.is_deleting() {
            // FullConfigs keep the last baseline snapshot.
            info!("ClusterConfig is being deleted, leaving FullConfigs as they are");
            return Ok(Action::Done);
        }

        let previous = ctx.locator.publish(key.clone());
        if previous.as_ref() != Some(key) {
            info!(previous = ?previous, "Active ClusterConfig changed");
        }

        let full_configs = ctx.cluster.full_configs.list(None).await?;
        if full_configs.is_empty() {
            debug!("No FullConfigs yet");
            return Ok(Action::RequeueAfter(ctx.settings.empty_requeue));
        }

        let stale = full_configs.iter().find(|full| {
            !full.metadata.is_deleting() && full.spec.cluster_config != baseline.spec.config
        });
        if let Some(stale) = stale {
            let mut rebased = stale.clone();
            rebased.adopt_baseline(&baseline.spec.config);
            let target = rebased.key();
            let result = ctx.cluster.full_configs.update(rebased).await;
            return Ok(match ctx.settle(&target, result).await? {
                Some(_) => {
                    info!(
                        full_config = %target,
                        "Rebased FullConfig on ClusterConfig"
                    );
                    Action::Requeue
                }
                None => Action::Done,
            });
        }

        for full in full_configs {
            if full.status.has_cluster_config || full.metadata.is_deleting() {
                continue;
            }
            let mut flagged = full;
            flagged.status.has_cluster_config = true;
            let target = flagged.key();
            let result = ctx.cluster.full_configs.update_status(flagged).await;
            if ctx.settle(&target, result).await?.is_some() {
                debug!(full_config = %target, "Marked hasClusterConfig");
            }
        }

        Ok(Action::Done)
    }

    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let all = self.ctx.cluster.cluster_configs.list(None).await?;
        Ok(all.iter().map(Resource::key).collect())
    }
}
