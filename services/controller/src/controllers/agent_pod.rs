//! Re-triggers delivery when an agent pod becomes reachable.

use std::sync::Arc;

use async_trait::async_trait;
use ipruler_reconcile::Action;
use tracing::{debug, info, instrument};

use super::{resolve, Context};
use crate::error::ReconcileError;
use crate::resources::{ObjectKey, Resource};
use crate::runtime::Reconciler;

pub struct AgentPodReconciler {
    ctx: Arc<Context>,
}

impl AgentPodReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for AgentPodReconciler {
    fn name(&self) -> &'static str {
        "agent-pod"
    }

    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let ctx = &self.ctx;
        let Some(pod) = ctx.cluster.pods.get_opt(key).await? else {
            return Ok(Action::Done);
        };
        if !ctx.settings.agent.selects(&pod) {
            return Ok(Action::Done);
        }
        if !pod.is_ready() {
            // The status change that makes it ready brings it back here.
            debug!("Agent pod not ready");
            return Ok(Action::Done);
        }

        let node_key = ObjectKey::cluster_scoped(&pod.spec.node_name);
        let Some(node) = ctx.cluster.nodes.get_opt(&node_key).await? else {
            info!(node = %pod.spec.node_name, "Agent node not registered yet");
            return Ok(Action::Done);
        };

        resolve::retrigger(ctx, &node.metadata.labels, "agent ready").await
    }

    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let agents = &self.ctx.settings.agent;
        let pods = self.ctx.cluster.pods.list(Some(&agents.namespace)).await?;
        Ok(pods
            .iter()
            .filter(|pod| agents.selects(pod))
            .map(Resource::key)
            .collect())
    }
}
