//! Event filters and key mappers for the controller watches.

use crate::agent::AgentSettings;
use crate::resources::{FullConfig, Node, NodeConfig, ObjectKey, Pod, Resource};
use crate::store::WatchEvent;

pub fn is_deleted<K>(event: &WatchEvent<K>) -> bool {
    matches!(event, WatchEvent::Deleted(_))
}

/// FullConfig changes the baseline controller cares about: new records, and
/// records whose baseline snapshot moved or still lack the baseline flag.
pub fn baseline_relevant(event: &WatchEvent<FullConfig>) -> bool {
    match event {
        WatchEvent::Added(_) => true,
        WatchEvent::Modified { old, new } => {
            old.spec.cluster_config != new.spec.cluster_config || !new.status.has_cluster_config
        }
        WatchEvent::Deleted(_) => false,
    }
}

/// Key of the NodeConfig controlling a FullConfig.
///
/// Writes that keep spec and ownership and leave `hasNodeConfig` set are
/// dropped.
pub fn owner_of_full_config(event: &WatchEvent<FullConfig>) -> Vec<ObjectKey> {
    if let WatchEvent::Modified { old, new } = event {
        if old.spec == new.spec
            && old.metadata.owner_references == new.metadata.owner_references
            && new.status.has_node_config
        {
            return Vec::new();
        }
    }

    let full = event.object();
    full.metadata
        .controller_owner()
        .filter(|owner| owner.kind == NodeConfig::KIND)
        .map(|owner| vec![ObjectKey::new(&full.metadata.namespace, &owner.name)])
        .unwrap_or_default()
}

/// FullConfig changes that call for a delivery pass.
///
/// Spec, annotation (trigger token) and deletion changes count; status-only
/// and finalizer-only writes do not.
pub fn delivery_relevant(event: &WatchEvent<FullConfig>) -> bool {
    match event {
        WatchEvent::Added(_) => true,
        WatchEvent::Modified { old, new } => {
            old.spec != new.spec
                || old.metadata.annotations != new.metadata.annotations
                || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        }
        WatchEvent::Deleted(_) => false,
    }
}

/// FullConfig changes after which some nodes may have a different winner
/// that was never told: the record vanished or its selector moved.
///
/// A record entering deletion does not count; with cleanup enabled its
/// successors are stamped after the cleanup pushes.
pub fn governance_changed(event: &WatchEvent<FullConfig>) -> bool {
    match event {
        WatchEvent::Added(_) => false,
        WatchEvent::Modified { old, new } => old.spec.node_selector != new.spec.node_selector,
        WatchEvent::Deleted(_) => true,
    }
}

/// Node changes that may move the node to another group or make it ready.
pub fn node_relevant(event: &WatchEvent<Node>) -> bool {
    match event {
        WatchEvent::Added(_) => true,
        WatchEvent::Modified { old, new } => {
            old.metadata.labels != new.metadata.labels
                || old.status.conditions != new.status.conditions
        }
        WatchEvent::Deleted(_) => false,
    }
}

/// Agent pod changes that may make the pod reachable.
pub fn agent_pod_relevant(agents: &AgentSettings, event: &WatchEvent<Pod>) -> bool {
    let pod = event.object();
    if !agents.selects(pod) {
        return false;
    }
    match event {
        WatchEvent::Added(_) => true,
        WatchEvent::Modified { old, new } => {
            old.is_ready() != new.is_ready()
                || old.status.pod_ip != new.status.pod_ip
                || old.spec.node_name != new.spec.node_name
        }
        WatchEvent::Deleted(_) => false,
    }
}
