//! Re-triggers delivery when a node's labels or readiness change, or when
//! the FullConfig that governed it stops matching.

use std::sync::Arc;

use async_trait::async_trait;
use ipruler_reconcile::Action;
use tracing::{debug, instrument};

use super::{resolve, Context};
use crate::error::ReconcileError;
use crate::resources::{ObjectKey, Resource};
use crate::runtime::Reconciler;

pub struct NodeReconciler {
    ctx: Arc<Context>,
}

impl NodeReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for NodeReconciler {
    fn name(&self) -> &'static str {
        "node"
    }

    #[instrument(skip(self), fields(node = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(node) = self.ctx.cluster.nodes.get_opt(key).await? else {
            debug!("Node not found");
            return Ok(Action::Done);
        };
        if node.metadata.is_deleting() {
            return Ok(Action::Done);
        }
        if !node.is_ready() {
            debug!("Node not ready");
            return Ok(Action::Done);
        }

        resolve::retrigger(&self.ctx, &node.metadata.labels, "node changed").await
    }

    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let all = self.ctx.cluster.nodes.list(None).await?;
        Ok(all.iter().map(Resource::key).collect())
    }
}
