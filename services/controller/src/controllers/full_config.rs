//! Delivery coordinator: pushes each FullConfig's merged configuration to
//! the agents it governs.
//!
//! An agent is targeted when it is ready, its node matches the record's
//! selector, and the record wins that node (see `ipruler_model::select_winner`).
//! Pushes fan out concurrently; a failed push is logged and never fails the
//! pass. With cleanup-on-delete enabled the record carries a finalizer and
//! its deletion sends cleanup pushes before the finalizer is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use ipruler_model::matches;
use ipruler_reconcile::{Action, SpecHash};
use tracing::{debug, info, instrument, warn};

use super::resolve::{live_full_configs, stamp, winner_for};
use super::Context;
use crate::agent::{AgentEndpoint, DeliveryError};
use crate::error::ReconcileError;
use crate::resources::{FullConfig, Node, ObjectKey, Resource, CLEANUP_FINALIZER};
use crate::runtime::Reconciler;

/// Counts for one delivery or cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    /// Agent pods that were not ready or whose node is unknown.
    pub skipped: usize,
}

/// Agents a pass will push to.
#[derive(Debug, Default)]
struct Targets {
    agents: Vec<AgentEndpoint>,
    skipped: usize,
    /// Other FullConfigs that win some of the matching nodes.
    governed_elsewhere: BTreeSet<ObjectKey>,
}

pub struct FullConfigReconciler {
    ctx: Arc<Context>,
}

impl FullConfigReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Push the merged configuration to every agent this record governs.
    pub async fn deliver(&self, full: &FullConfig) -> Result<DeliveryReport, ReconcileError> {
        let payload = full.spec.merged_config.to_yaml()?;
        let digest = SpecHash::from_json(&serde_json::to_value(&full.spec.merged_config)?);

        let candidates = live_full_configs(&self.ctx).await?;
        let targets = self.targets(full, &candidates).await?;
        let (delivered, failed) = self.fan_out(targets.agents, Some(&payload)).await;

        let report = DeliveryReport {
            delivered,
            failed,
            skipped: targets.skipped,
        };
        info!(
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            digest = %digest,
            "Delivery pass finished"
        );
        Ok(report)
    }

    /// Send cleanup pushes for a record being deleted, then hand its nodes
    /// to whichever FullConfig now wins them.
    async fn clean_up(&self, full: &FullConfig) -> Result<DeliveryReport, ReconcileError> {
        let candidates = live_full_configs(&self.ctx).await?;
        let targets = self.targets(full, &candidates).await?;
        let (delivered, failed) = self.fan_out(targets.agents, None).await;

        let report = DeliveryReport {
            delivered,
            failed,
            skipped: targets.skipped,
        };
        info!(
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Cleanup pass finished"
        );

        for successor in targets.governed_elsewhere {
            if let Some(found) = candidates.iter().find(|c| c.key() == successor) {
                stamp(&self.ctx, found.clone(), "predecessor deleted").await?;
            }
        }
        Ok(report)
    }

    async fn targets(
        &self,
        full: &FullConfig,
        candidates: &[FullConfig],
    ) -> Result<Targets, ReconcileError> {
        let agents = &self.ctx.settings.agent;
        let pods = self.ctx.cluster.pods.list(Some(&agents.namespace)).await?;
        let nodes: HashMap<String, Node> = self
            .ctx
            .cluster
            .nodes
            .list(None)
            .await?
            .into_iter()
            .map(|node| (node.metadata.name.clone(), node))
            .collect();

        let own_key = full.key();
        let mut targets = Targets::default();
        for pod in pods.iter().filter(|pod| agents.selects(pod)) {
            let Some(agent) = AgentEndpoint::from_pod(pod) else {
                debug!(pod = %pod.key(), "Agent not ready, skipping");
                targets.skipped += 1;
                continue;
            };
            let Some(node) = nodes.get(&agent.node_name) else {
                debug!(agent = %agent, node = %agent.node_name, "Agent node unknown, skipping");
                targets.skipped += 1;
                continue;
            };
            if !matches(&full.spec.node_selector, &node.metadata.labels) {
                continue;
            }

            match winner_for(candidates, &node.metadata.labels) {
                Some(winner) if winner.key() != own_key => {
                    debug!(
                        agent = %agent,
                        winner = %winner.key(),
                        "Node governed by another FullConfig"
                    );
                    targets.governed_elsewhere.insert(winner.key());
                }
                _ => targets.agents.push(agent),
            }
        }
        Ok(targets)
    }

    /// Push to every agent, at most `max_concurrent_pushes` at a time.
    /// `None` sends cleanup. Returns (succeeded, failed).
    async fn fan_out(&self, agents: Vec<AgentEndpoint>, payload: Option<&str>) -> (usize, usize) {
        let transport = &self.ctx.transport;
        let limit = self.ctx.settings.max_concurrent_pushes.max(1);

        let results: Vec<(AgentEndpoint, Result<String, DeliveryError>)> = stream::iter(agents)
            .map(|agent| async move {
                let result = match payload {
                    Some(payload) => transport.push_config(&agent, payload).await,
                    None => transport.cleanup(&agent).await,
                };
                (agent, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut succeeded = 0;
        let mut failed = 0;
        for (agent, result) in results {
            match result {
                Ok(response) => {
                    succeeded += 1;
                    info!(agent = %agent, response = %response.trim(), "Agent accepted push");
                }
                Err(e) => {
                    failed += 1;
                    warn!(agent = %agent, error = %e, "Agent push failed");
                }
            }
        }
        (succeeded, failed)
    }

    /// Add or drop the cleanup finalizer to match the setting.
    ///
    /// `None` means the write lost a race and the pass should stop.
    async fn sync_finalizer(&self, full: FullConfig) -> Result<Option<FullConfig>, ReconcileError> {
        let wanted = self.ctx.settings.cleanup_on_delete;
        if full.metadata.has_finalizer(CLEANUP_FINALIZER) == wanted {
            return Ok(Some(full));
        }

        let mut updated = full;
        if wanted {
            updated.metadata.add_finalizer(CLEANUP_FINALIZER);
        } else {
            updated.metadata.remove_finalizer(CLEANUP_FINALIZER);
        }
        let key = updated.key();
        let result = self.ctx.cluster.full_configs.update(updated).await;
        self.ctx.settle(&key, result).await
    }

    async fn finalize(&self, full: FullConfig) -> Result<Action, ReconcileError> {
        if !full.metadata.has_finalizer(CLEANUP_FINALIZER) {
            return Ok(Action::Done);
        }
        if self.ctx.settings.cleanup_on_delete {
            self.clean_up(&full).await?;
        }

        let mut released = full;
        released.metadata.remove_finalizer(CLEANUP_FINALIZER);
        let key = released.key();
        let result = self.ctx.cluster.full_configs.update(released).await;
        if self.ctx.settle(&key, result).await?.is_some() {
            info!("Released cleanup finalizer");
        }
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for FullConfigReconciler {
    fn name(&self) -> &'static str {
        "full-config"
    }

    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(full) = self.ctx.cluster.full_configs.get_opt(key).await? else {
            debug!("FullConfig not found");
            return Ok(Action::Done);
        };

        if full.metadata.is_deleting() {
            return self.finalize(full).await;
        }

        let Some(full) = self.sync_finalizer(full).await? else {
            return Ok(Action::Done);
        };

        self.deliver(&full).await?;
        Ok(Action::Done)
    }

    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let all = self.ctx.cluster.full_configs.list(None).await?;
        Ok(all.iter().map(Resource::key).collect())
    }
}
