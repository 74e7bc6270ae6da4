//! Keeps each NodeConfig's FullConfig in step with its selector and overlay.

use std::sync::Arc;

use async_trait::async_trait;
use ipruler_reconcile::Action;
use tracing::{debug, info, instrument};

use super::Context;
use crate::error::ReconcileError;
use crate::resources::{FullConfig, ObjectKey, Resource};
use crate::runtime::Reconciler;

pub struct NodeConfigReconciler {
    ctx: Arc<Context>,
}

impl NodeConfigReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for NodeConfigReconciler {
    fn name(&self) -> &'static str {
        "node-config"
    }

    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let ctx = &self.ctx;
        let Some(node_config) = ctx.cluster.node_configs.get_opt(key).await? else {
            // The FullConfig goes with its owner.
            info!("NodeConfig not found");
            return Ok(Action::Done);
        };
        if node_config.metadata.is_deleting() {
            return Ok(Action::Done);
        }

        let Some(full) = ctx.cluster.full_configs.get_opt(key).await? else {
            let result = ctx
                .cluster
                .full_configs
                .create(FullConfig::for_node_config(&node_config))
                .await;
            if ctx.settle(key, result).await?.is_some() {
                info!("Created FullConfig");
            }
            // Requeue either way: to set the flag, or to reread after losing
            // the create race.
            return Ok(Action::Requeue);
        };

        if full.metadata.is_deleting() {
            debug!("FullConfig is being deleted, waiting");
            return Ok(Action::Done);
        }

        if full.overlay_differs(&node_config) || !full.is_controlled_by(&node_config) {
            let mut updated = full;
            updated.adopt_overlay(&node_config);
            let result = ctx.cluster.full_configs.update(updated).await;
            return Ok(match ctx.settle(key, result).await? {
                Some(_) => {
                    info!("Updated FullConfig from NodeConfig");
                    Action::Requeue
                }
                None => Action::Done,
            });
        }

        if !full.status.has_node_config {
            let mut flagged = full;
            flagged.status.has_node_config = true;
            let result = ctx.cluster.full_configs.update_status(flagged).await;
            if ctx.settle(key, result).await?.is_some() {
                debug!("Marked hasNodeConfig");
            }
        }

        Ok(Action::Done)
    }

    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let all = self.ctx.cluster.node_configs.list(None).await?;
        Ok(all.iter().map(Resource::key).collect())
    }
}
