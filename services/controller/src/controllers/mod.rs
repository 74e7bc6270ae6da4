//! The reconcilers and their wiring.
//!
//! | Controller       | Primary kind  | Also watches                 |
//! |------------------|---------------|------------------------------|
//! | `cluster-config` | ClusterConfig | FullConfig (to the baseline) |
//! | `node-config`    | NodeConfig    | FullConfig (to its owner)    |
//! | `full-config`    | FullConfig    |                              |
//! | `node`           | Node          | FullConfig (resync on loss)  |
//! | `agent-pod`      | Pod           |                              |
//!
//! Every pass reads fresh state. A write that loses an optimistic-concurrency
//! race is abandoned and the pass ends; the event produced by the winning
//! write drives the next pass.

mod agent_pod;
mod cluster_config;
mod full_config;
mod node;
mod node_config;
pub mod predicates;
mod resolve;

use std::sync::Arc;
use std::time::Duration;

use ipruler_reconcile::{ConflictTracker, DEFAULT_EMPTY_REQUEUE};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{AgentSettings, AgentTransport};
use crate::error::ReconcileError;
use crate::locator::ActiveBaselineLocator;
use crate::resources::{ObjectKey, Resource};
use crate::runtime::{own_key, Controller};
use crate::store::{Cluster, StoreError};

pub use agent_pod::AgentPodReconciler;
pub use cluster_config::ClusterConfigReconciler;
pub use full_config::{DeliveryReport, FullConfigReconciler};
pub use node::NodeReconciler;
pub use node_config::NodeConfigReconciler;

/// Tunables shared by the reconcilers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub agent: AgentSettings,
    /// Send cleanup pushes when a FullConfig is deleted.
    pub cleanup_on_delete: bool,
    /// Requeue delay while the baseline has no FullConfigs to feed.
    pub empty_requeue: Duration,
    /// Upper bound on in-flight pushes per delivery pass.
    pub max_concurrent_pushes: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            cleanup_on_delete: false,
            empty_requeue: DEFAULT_EMPTY_REQUEUE,
            max_concurrent_pushes: 16,
        }
    }
}

/// State handed to every reconciler.
pub struct Context {
    pub cluster: Cluster,
    pub locator: ActiveBaselineLocator,
    pub settings: ControllerSettings,
    pub transport: Arc<dyn AgentTransport>,
    conflicts: Mutex<ConflictTracker>,
}

impl Context {
    pub fn new(
        cluster: Cluster,
        locator: ActiveBaselineLocator,
        settings: ControllerSettings,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            cluster,
            locator,
            settings,
            transport,
            conflicts: Mutex::new(ConflictTracker::default()),
        }
    }

    /// Resolve a write result.
    ///
    /// `Ok(None)` means the write lost a race (or its target vanished) and
    /// the pass should stop. Other store errors propagate for backoff.
    pub(crate) async fn settle<K: Resource>(
        &self,
        key: &ObjectKey,
        result: Result<K, StoreError>,
    ) -> Result<Option<K>, ReconcileError> {
        let tracked = format!("{}/{}", K::KIND, key);
        match result {
            Ok(obj) => {
                self.conflicts.lock().await.clear(&tracked);
                Ok(Some(obj))
            }
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                let (count, stuck) = {
                    let mut conflicts = self.conflicts.lock().await;
                    conflicts.prune();
                    conflicts.record(&tracked)
                };
                if stuck {
                    warn!(
                        kind = K::KIND,
                        namespace = %key.namespace,
                        name = %key.name,
                        conflicts = count,
                        error = %e,
                        "Repeated write conflicts, object may not be converging"
                    );
                } else {
                    info!(
                        kind = K::KIND,
                        namespace = %key.namespace,
                        name = %key.name,
                        error = %e,
                        "Write conflict, abandoning pass"
                    );
                }
                Ok(None)
            }
            Err(e) if e.is_not_found() => {
                info!(
                    kind = K::KIND,
                    namespace = %key.namespace,
                    name = %key.name,
                    "Object disappeared before write, abandoning pass"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Build every controller and spawn it. Handles finish after shutdown.
pub fn spawn_all(ctx: Arc<Context>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let cluster = ctx.cluster.clone();
    let mut handles = Vec::new();

    let cluster_config = Controller::new(
        Arc::new(ClusterConfigReconciler::new(ctx.clone())),
        shutdown.clone(),
    )
    .watches(cluster.cluster_configs.watch(), own_key)
    .watches(cluster.full_configs.watch(), {
        let locator = ctx.locator.clone();
        move |event| {
            if predicates::baseline_relevant(event) {
                locator.current().into_iter().collect()
            } else {
                Vec::new()
            }
        }
    });
    handles.push(tokio::spawn(cluster_config.run()));

    let node_config = Controller::new(
        Arc::new(NodeConfigReconciler::new(ctx.clone())),
        shutdown.clone(),
    )
    .watches(cluster.node_configs.watch(), |event| {
        if predicates::is_deleted(event) {
            Vec::new()
        } else {
            own_key(event)
        }
    })
    .watches(cluster.full_configs.watch(), predicates::owner_of_full_config);
    handles.push(tokio::spawn(node_config.run()));

    let full_config = Controller::new(
        Arc::new(FullConfigReconciler::new(ctx.clone())),
        shutdown.clone(),
    )
    .watches(cluster.full_configs.watch(), |event| {
        if predicates::delivery_relevant(event) {
            own_key(event)
        } else {
            Vec::new()
        }
    });
    handles.push(tokio::spawn(full_config.run()));

    let node = Controller::new(Arc::new(NodeReconciler::new(ctx.clone())), shutdown.clone())
        .watches(cluster.nodes.watch(), |event| {
            if predicates::node_relevant(event) {
                own_key(event)
            } else {
                Vec::new()
            }
        })
        .resyncs_on(cluster.full_configs.watch(), predicates::governance_changed);
    handles.push(tokio::spawn(node.run()));

    let agents = ctx.settings.agent.clone();
    let agent_pod = Controller::new(Arc::new(AgentPodReconciler::new(ctx)), shutdown)
        .watches(cluster.pods.watch(), move |event| {
            if predicates::agent_pod_relevant(&agents, event) {
                own_key(event)
            } else {
                Vec::new()
            }
        });
    handles.push(tokio::spawn(agent_pod.run()));

    handles
}
