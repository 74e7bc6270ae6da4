//! Nodes and agent pods, reduced to the fields delivery decisions read.

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

/// Condition types that must all be `True` for a pod to receive pushes.
pub const POD_READINESS_CONDITIONS: [&str; 2] = ["Ready", "ContainersReady"];

/// Condition type reporting node readiness.
pub const NODE_READY: &str = "Ready";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
        }
    }
}

/// A cluster node. Cluster-scoped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Node {
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.type_ == NODE_READY && c.status == ConditionStatus::True)
    }
}

impl Resource for Node {
    const KIND: &'static str = "Node";
    const NAMESPACED: bool = false;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// An agent pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(rename = "podIP", default, skip_serializing_if = "String::is_empty")]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Pod {
    /// Running, not terminating, addressed, and every readiness condition true.
    pub fn is_ready(&self) -> bool {
        self.status.phase == PodPhase::Running
            && !self.metadata.is_deleting()
            && !self.status.pod_ip.is_empty()
            && self
                .status
                .conditions
                .iter()
                .filter(|c| POD_READINESS_CONDITIONS.contains(&c.type_.as_str()))
                .all(|c| c.status == ConditionStatus::True)
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}
