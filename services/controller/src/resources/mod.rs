//! Stored resource kinds and their shared metadata.
//!
//! Every record in the store carries an [`ObjectMeta`]. The store owns
//! `uid`, `resourceVersion`, `creationTimestamp` and `deletionTimestamp`;
//! everything else is written by clients.

mod corev1;
mod ipruler;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use self::corev1::{
    Condition, ConditionStatus, Node, NodeStatus, Pod, PodPhase, PodSpec, PodStatus,
};
pub use self::ipruler::{
    ClusterConfig, ClusterConfigSpec, FullConfig, FullConfigSpec, FullConfigStatus, NodeConfig,
    NodeConfigSpec, CLEANUP_FINALIZER, TRIGGER_ANNOTATION,
};

/// A kind of record held by the store.
pub trait Resource:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name used in logs, errors and owner references.
    const KIND: &'static str;

    /// Cluster-scoped kinds ignore the namespace.
    const NAMESPACED: bool = true;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copy the status subresource of `other` onto `self`.
    ///
    /// Kinds without a status keep the default no-op.
    fn set_status_from(&mut self, _other: &Self) {}

    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.meta().namespace, &self.meta().name)
    }
}

/// Namespace and name of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped record.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Reference from a dependent record to the record that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// Metadata common to every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Optimistic-concurrency token. Writes must carry the version they read.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns true once deletion was requested but finalizers are pending.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    /// The owner reference marked as controller, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }
}
