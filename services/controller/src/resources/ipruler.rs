//! Routing configuration records: the cluster baseline, node-group overlays,
//! and the merged record derived for each overlay.

use ipruler_model::{merge_configs, ConfigModel, NodeSelector, SelectorCandidate};
use ipruler_reconcile::next_trigger_token;
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, OwnerReference, Resource};

/// Annotation stamped on a FullConfig to force redelivery without a spec change.
pub const TRIGGER_ANNOTATION: &str = "ipruler.io/last-update-trigger";

/// Finalizer held on a FullConfig while agents still need a cleanup push.
pub const CLEANUP_FINALIZER: &str = "ipruler.io/agent-cleanup";

/// The fleet-wide baseline. One logical instance per cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterConfigSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfigSpec {
    #[serde(default)]
    pub config: ConfigModel,
}

impl Resource for ClusterConfig {
    const KIND: &'static str = "ClusterConfig";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A node-group overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub config: ConfigModel,
}

impl NodeConfig {
    /// Owner reference a FullConfig carries back to this NodeConfig.
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
        }
    }
}

impl Resource for NodeConfig {
    const KIND: &'static str = "NodeConfig";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The merged record for one node group.
///
/// `merged_config` is always `merge(cluster_config, node_config)`; every
/// writer recomputes it from the two snapshots it stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FullConfigSpec,
    #[serde(default)]
    pub status: FullConfigStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullConfigSpec {
    #[serde(default)]
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub cluster_config: ConfigModel,
    #[serde(default)]
    pub node_config: ConfigModel,
    #[serde(default)]
    pub merged_config: ConfigModel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullConfigStatus {
    #[serde(default)]
    pub has_node_config: bool,
    #[serde(default)]
    pub has_cluster_config: bool,
}

impl FullConfig {
    /// A new record owned by `owner`, seeded with its selector and overlay.
    ///
    /// The baseline snapshot stays empty until the cluster-config controller
    /// fills it in.
    pub fn for_node_config(owner: &NodeConfig) -> Self {
        let mut full = Self {
            metadata: ObjectMeta::named(&owner.metadata.namespace, &owner.metadata.name),
            spec: FullConfigSpec {
                node_selector: owner.spec.node_selector.clone(),
                node_config: owner.spec.config.clone(),
                ..Default::default()
            },
            status: FullConfigStatus::default(),
        };
        full.metadata.owner_references.push(owner.controller_reference());
        full.refresh_merged();
        full
    }

    /// Recompute the merge from the stored snapshots.
    pub fn refresh_merged(&mut self) {
        self.spec.merged_config = merge_configs(&self.spec.cluster_config, &self.spec.node_config);
    }

    /// Returns true if the stored merge matches the stored snapshots.
    pub fn is_consistent(&self) -> bool {
        self.spec.merged_config == merge_configs(&self.spec.cluster_config, &self.spec.node_config)
    }

    /// Returns true if this record is controlled by `owner` (same uid).
    pub fn is_controlled_by(&self, owner: &NodeConfig) -> bool {
        self.metadata
            .controller_owner()
            .is_some_and(|r| r.kind == NodeConfig::KIND && r.uid == owner.metadata.uid)
    }

    /// Returns true if selector or overlay differ from `owner`'s.
    pub fn overlay_differs(&self, owner: &NodeConfig) -> bool {
        self.spec.node_config != owner.spec.config
            || self.spec.node_selector != owner.spec.node_selector
    }

    /// Copy selector, overlay and controller reference from `owner` and re-merge.
    pub fn adopt_overlay(&mut self, owner: &NodeConfig) {
        self.spec.node_selector = owner.spec.node_selector.clone();
        self.spec.node_config = owner.spec.config.clone();
        if !self.is_controlled_by(owner) {
            self.metadata.owner_references.retain(|r| !r.controller);
            self.metadata
                .owner_references
                .push(owner.controller_reference());
        }
        self.refresh_merged();
    }

    /// Replace the baseline snapshot and re-merge.
    pub fn adopt_baseline(&mut self, baseline: &ConfigModel) {
        self.spec.cluster_config = baseline.clone();
        self.refresh_merged();
    }

    pub fn trigger_token(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(TRIGGER_ANNOTATION)
            .map(String::as_str)
    }

    /// Stamp a new, strictly greater trigger token. Returns the token.
    pub fn stamp_trigger(&mut self) -> String {
        let token = next_trigger_token(self.trigger_token());
        self.metadata
            .annotations
            .insert(TRIGGER_ANNOTATION.to_string(), token.clone());
        token
    }
}

impl SelectorCandidate for FullConfig {
    fn node_selector(&self) -> &NodeSelector {
        &self.spec.node_selector
    }

    fn identity(&self) -> (&str, &str) {
        (&self.metadata.namespace, &self.metadata.name)
    }
}

impl Resource for FullConfig {
    const KIND: &'static str = "FullConfig";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status;
    }
}
